//! Synthetic storage module (spec §4.8): subscribes to `event.*` and
//! republishes a placeholder acknowledgement on `storage.*`. Stands in
//! for a real filesystem/object-store writer, which the core never
//! touches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{Capability, Envelope, HealthStatus, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::field_str;

struct Inner {
    source_topic: Mutex<Topic>,
    storage_topic: Mutex<Topic>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

pub struct StorageShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl StorageShim {
    pub fn new(id: impl Into<String>, source_topic: Topic, storage_topic: Topic) -> Self {
        Self {
            capability: Capability {
                id: id.into(),
                category: ModuleCategory::Storage,
                publishes: vec![storage_topic.clone()],
                subscribes: vec![source_topic.clone()],
                config_fragment_path: "storage".into(),
                restart_on_configure_failure: true,
            },
            inner: Arc::new(Inner {
                source_topic: Mutex::new(source_topic),
                storage_topic: Mutex::new(storage_topic),
                subscription: Mutex::new(None),
                bus: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Module for StorageShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let topic = field_str(&fragment, "storage_topic", self.inner.storage_topic.lock().as_str());
        *self.inner.storage_topic.lock() = Topic::new_unchecked(topic);
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let source_topic = self.inner.source_topic.lock().clone();
        let handler = Arc::new(StorageHandler {
            inner: self.inner.clone(),
            bus: bus.clone(),
        });
        let handle = bus
            .subscribe_default(&source_topic, &self.capability.id, handler)
            .await
            .map_err(ModuleError::Bus)?;
        *self.inner.subscription.lock() = Some(handle);
        *self.inner.bus.lock() = Some(bus);
        info!(storage_id = %self.capability.id, "storage shim started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        let bus = self.inner.bus.lock().take();
        let handle = self.inner.subscription.lock().take();
        if let (Some(bus), Some(handle)) = (bus, handle) {
            let _ = bus.unsubscribe(handle).await;
        }
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let state = if self.inner.subscription.lock().is_some() {
            ModuleState::Healthy
        } else {
            ModuleState::Stopped
        };
        HealthStatus {
            module_id: self.capability.id.clone(),
            state,
            detail: HashMap::new(),
            last_seen: Utc::now(),
        }
    }
}

struct StorageHandler {
    inner: Arc<Inner>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for StorageHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::MediaArtifact(artifact) = &envelope.payload else {
            return Ok(());
        };
        let storage_topic = self.inner.storage_topic.lock().clone();
        self.bus
            .publish(
                &storage_topic,
                Payload::MediaArtifact(artifact.clone()),
                PublishMetadata {
                    correlation_id: envelope.correlation_id,
                },
            )
            .await?;
        Ok(())
    }
}
