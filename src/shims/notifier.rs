//! Synthetic notifier module (spec §4.8): subscribes to `event.*` and
//! counts deliveries. Stands in for a real SMS/push/webhook sink, which
//! the core never touches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{Capability, Envelope, HealthStatus, ModuleCategory, ModuleState, Payload};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::field_str;
use crate::contracts::Topic;

struct Inner {
    source_topic: Mutex<Topic>,
    delivered: AtomicU64,
    subscription: Mutex<Option<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

pub struct NotifierShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl NotifierShim {
    pub fn new(id: impl Into<String>, source_topic: Topic) -> Self {
        Self {
            capability: Capability {
                id: id.into(),
                category: ModuleCategory::Output,
                publishes: vec![],
                subscribes: vec![source_topic.clone()],
                config_fragment_path: "outputs".into(),
                restart_on_configure_failure: true,
            },
            inner: Arc::new(Inner {
                source_topic: Mutex::new(source_topic),
                delivered: AtomicU64::new(0),
                subscription: Mutex::new(None),
                bus: Mutex::new(None),
            }),
        }
    }

    pub fn delivered_count(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Module for NotifierShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let topic = field_str(&fragment, "source_topic", self.inner.source_topic.lock().as_str());
        *self.inner.source_topic.lock() = Topic::new_unchecked(topic);
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let topic = self.inner.source_topic.lock().clone();
        let handler = Arc::new(NotifierHandler {
            inner: self.inner.clone(),
        });
        let handle = bus
            .subscribe_default(&topic, &self.capability.id, handler)
            .await
            .map_err(ModuleError::Bus)?;
        *self.inner.subscription.lock() = Some(handle);
        *self.inner.bus.lock() = Some(bus);
        info!(notifier_id = %self.capability.id, "notifier shim started");
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

struct NotifierHandler {
    inner: Arc<Inner>,
}

#[async_trait]
impl Handler for NotifierHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Payload::MediaArtifact(_) | Payload::AlertNotification(_) = &envelope.payload {
            self.inner.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
