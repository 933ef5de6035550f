//! Synthetic processor module (spec §4.8): subscribes to camera frame
//! topics and publishes a `DetectionEvent` per frame only when armed via
//! `set_emitting` — a test hook standing in for real model inference,
//! which the core never runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{BoundingBox, Capability, DetectionEvent, DetectionKind, Envelope, HealthStatus, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::field_str;

struct Inner {
    source_topics: Mutex<Vec<Topic>>,
    detection_topic: Mutex<Topic>,
    emitting: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

pub struct ProcessorShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl ProcessorShim {
    pub fn new(id: impl Into<String>, source_topics: Vec<Topic>, detection_topic: Topic) -> Self {
        Self {
            capability: Capability {
                id: id.into(),
                category: ModuleCategory::Processor,
                publishes: vec![detection_topic.clone()],
                subscribes: source_topics.clone(),
                config_fragment_path: "process".into(),
                restart_on_configure_failure: true,
            },
            inner: Arc::new(Inner {
                source_topics: Mutex::new(source_topics),
                detection_topic: Mutex::new(detection_topic),
                emitting: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                bus: Mutex::new(None),
            }),
        }
    }

    /// Test hook: when armed, every frame seen produces one synthetic
    /// `DetectionEvent`.
    pub fn set_emitting(&self, emitting: bool) {
        self.inner.emitting.store(emitting, Ordering::SeqCst);
    }
}

#[async_trait]
impl Module for ProcessorShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let detection_topic = field_str(&fragment, "detection_topic", self.inner.detection_topic.lock().as_str());
        *self.inner.detection_topic.lock() = Topic::new_unchecked(detection_topic);
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let topics = self.inner.source_topics.lock().clone();
        let mut handles = Vec::new();
        for topic in topics {
            let handler = Arc::new(ProcessorHandler {
                inner: self.inner.clone(),
                bus: bus.clone(),
            });
            let handle = bus
                .subscribe_default(&topic, format!("{}-{}", self.capability.id, topic.as_str()), handler)
                .await
                .map_err(ModuleError::Bus)?;
            handles.push(handle);
        }
        *self.inner.subscriptions.lock() = handles;
        *self.inner.bus.lock() = Some(bus);
        info!(processor_id = %self.capability.id, "processor shim started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        let bus = self.inner.bus.lock().take();
        let handles = std::mem::take(&mut *self.inner.subscriptions.lock());
        if let Some(bus) = bus {
            for handle in handles {
                let _ = bus.unsubscribe(handle).await;
            }
        }
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let state = if self.inner.subscriptions.lock().is_empty() {
            ModuleState::Stopped
        } else {
            ModuleState::Healthy
        };
        HealthStatus {
            module_id: self.capability.id.clone(),
            state,
            detail: HashMap::new(),
            last_seen: Utc::now(),
        }
    }
}

struct ProcessorHandler {
    inner: Arc<Inner>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for ProcessorHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::Frame(frame) = &envelope.payload else {
            return Ok(());
        };
        if !self.inner.emitting.load(Ordering::SeqCst) {
            return Ok(());
        }

        let detection_topic = self.inner.detection_topic.lock().clone();
        self.bus
            .publish(
                &detection_topic,
                Payload::DetectionEvent(DetectionEvent {
                    camera_id: frame.camera_id.clone(),
                    timestamp: frame.timestamp,
                    kind: DetectionKind::Motion,
                    label: "shim".into(),
                    confidence: 1.0,
                    bbox: BoundingBox::default(),
                    attributes: HashMap::new(),
                }),
                PublishMetadata {
                    correlation_id: envelope.correlation_id,
                },
            )
            .await?;
        Ok(())
    }
}
