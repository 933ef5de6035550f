//! Synthetic artifact builder (spec §4.8): subscribes to `process.*`
//! detections and publishes a placeholder `MediaArtifact` on `event.*`
//! per detection. Stands in for real snapshot/GIF/clip encoding, which
//! the core never performs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{ArtifactKind, Capability, DetectionEvent, Envelope, HealthStatus, MediaArtifact, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::field_str;

struct Inner {
    source_topic: Mutex<Topic>,
    artifact_topic: Mutex<Topic>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

pub struct ArtifactShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl ArtifactShim {
    pub fn new(id: impl Into<String>, source_topic: Topic, artifact_topic: Topic) -> Self {
        Self {
            capability: Capability {
                id: id.into(),
                category: ModuleCategory::EventBuilder,
                publishes: vec![artifact_topic.clone()],
                subscribes: vec![source_topic.clone()],
                config_fragment_path: "event".into(),
                restart_on_configure_failure: true,
            },
            inner: Arc::new(Inner {
                source_topic: Mutex::new(source_topic),
                artifact_topic: Mutex::new(artifact_topic),
                subscription: Mutex::new(None),
                bus: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Module for ArtifactShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let artifact_topic = field_str(&fragment, "artifact_topic", self.inner.artifact_topic.lock().as_str());
        *self.inner.artifact_topic.lock() = Topic::new_unchecked(artifact_topic);
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let source_topic = self.inner.source_topic.lock().clone();
        let handler = Arc::new(ArtifactHandler {
            inner: self.inner.clone(),
            bus: bus.clone(),
        });
        let handle = bus
            .subscribe_default(&source_topic, &self.capability.id, handler)
            .await
            .map_err(ModuleError::Bus)?;
        *self.inner.subscription.lock() = Some(handle);
        *self.inner.bus.lock() = Some(bus);
        info!(artifact_id = %self.capability.id, "artifact shim started");
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

struct ArtifactHandler {
    inner: Arc<Inner>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for ArtifactHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::DetectionEvent(detection) = &envelope.payload else {
            return Ok(());
        };
        let artifact_topic = self.inner.artifact_topic.lock().clone();
        self.bus
            .publish(
                &artifact_topic,
                Payload::MediaArtifact(artifact_from(detection)),
                PublishMetadata {
                    correlation_id: envelope.correlation_id,
                },
            )
            .await?;
        Ok(())
    }
}

fn artifact_from(detection: &DetectionEvent) -> MediaArtifact {
    MediaArtifact {
        kind: ArtifactKind::Snapshot,
        path_or_handle: format!("shim://{}/{}", detection.camera_id, detection.timestamp.timestamp_millis()),
        camera_id: detection.camera_id.clone(),
        timestamp: detection.timestamp,
        metadata: HashMap::new(),
    }
}
