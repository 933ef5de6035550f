//! Synthetic input module (spec §4.8): publishes empty `Frame`s on a
//! timer to `camera.<id>.frame`. Stands in for a real RTSP/ONVIF camera
//! driver, which the core never implements.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::BusHandle;
use crate::contracts::{Capability, Frame, FrameData, HealthStatus, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::{field_str, field_u64};

struct Inner {
    frame_topic: Mutex<Topic>,
    width: Mutex<u32>,
    height: Mutex<u32>,
    interval_ms: Mutex<u64>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// One instance per configured camera id (spec §4.1: capability `id`
/// matches the fragment `id` so the orchestrator's reconfigure diff
/// works the same way for shims as for real modules).
pub struct CameraShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl CameraShim {
    pub fn new(camera_id: impl Into<String>) -> Self {
        let camera_id = camera_id.into();
        let frame_topic = Topic::new_unchecked(format!("camera.{camera_id}.frame"));
        Self {
            capability: Capability {
                id: camera_id,
                category: ModuleCategory::Input,
                publishes: vec![frame_topic.clone()],
                subscribes: vec![],
                config_fragment_path: "cameras".into(),
                restart_on_configure_failure: true,
            },
            inner: Arc::new(Inner {
                frame_topic: Mutex::new(frame_topic),
                width: Mutex::new(640),
                height: Mutex::new(480),
                interval_ms: Mutex::new(1000),
                task: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Module for CameraShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        *self.inner.width.lock() = field_u64(&fragment, "width", 640) as u32;
        *self.inner.height.lock() = field_u64(&fragment, "height", 480) as u32;
        *self.inner.interval_ms.lock() = field_u64(&fragment, "interval_ms", 1000);
        let topic = field_str(&fragment, "frame_topic", self.inner.frame_topic.lock().as_str());
        *self.inner.frame_topic.lock() = Topic::new_unchecked(topic);
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let inner = self.inner.clone();
        let camera_id = self.capability.id.clone();
        let task = tokio::spawn(async move {
            loop {
                let interval_ms = *inner.interval_ms.lock();
                tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
                let (width, height, topic) = {
                    (*inner.width.lock(), *inner.height.lock(), inner.frame_topic.lock().clone())
                };
                let frame = Frame {
                    camera_id: camera_id.clone(),
                    timestamp: Utc::now(),
                    width,
                    height,
                    data: FrameData::Inline(Vec::new()),
                    attributes: HashMap::new(),
                };
                if bus
                    .publish(&topic, Payload::Frame(frame), PublishMetadata::default())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        *self.inner.task.lock() = Some(task);
        info!(camera_id = %self.capability.id, "camera shim started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        let state = if self.inner.task.lock().is_some() {
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
