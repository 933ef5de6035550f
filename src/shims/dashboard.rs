//! Synthetic dashboard module (spec §4.8): subscribes to `status.*` and
//! `analytics.*`, and exposes `emit_control_command`/`emit_config_update`
//! test hooks standing in for operator-driven UI actions. The core only
//! routes these; it never renders anything.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::info;

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{Capability, ConfigUpdate, ControlCommand, Envelope, HealthStatus, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

struct Inner {
    status_topic: Mutex<Topic>,
    analytics_topic: Mutex<Topic>,
    control_topic: Mutex<Topic>,
    config_update_topic: Mutex<Topic>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

pub struct DashboardShim {
    capability: Capability,
    inner: Arc<Inner>,
}

impl DashboardShim {
    pub fn new(id: impl Into<String>, status_topic: Topic, analytics_topic: Topic) -> Self {
        let control_topic = Topic::new_unchecked("dashboard.control.command");
        let config_update_topic = Topic::new_unchecked("config.update");
        Self {
            capability: Capability {
                id: id.into(),
                category: ModuleCategory::Dashboard,
                publishes: vec![control_topic.clone(), config_update_topic.clone()],
                subscribes: vec![status_topic.clone(), analytics_topic.clone()],
                config_fragment_path: "dashboards".into(),
                restart_on_configure_failure: false,
            },
            inner: Arc::new(Inner {
                status_topic: Mutex::new(status_topic),
                analytics_topic: Mutex::new(analytics_topic),
                control_topic: Mutex::new(control_topic),
                config_update_topic: Mutex::new(config_update_topic),
                subscriptions: Mutex::new(Vec::new()),
                bus: Mutex::new(None),
            }),
        }
    }

    /// Test/operator hook: send a control command as if an operator had
    /// clicked a button in a real dashboard UI.
    pub async fn emit_control_command(&self, command: ControlCommand) -> Result<(), ModuleError> {
        let (bus, topic) = {
            (self.inner.bus.lock().clone(), self.inner.control_topic.lock().clone())
        };
        if let Some(bus) = bus {
            bus.publish(&topic, Payload::ControlCommand(command), PublishMetadata::default())
                .await
                .map_err(ModuleError::Bus)?;
        }
        Ok(())
    }

    /// Test/operator hook: push a config edit as if typed into a settings
    /// panel.
    pub async fn emit_config_update(&self, update: ConfigUpdate) -> Result<(), ModuleError> {
        let (bus, topic) = {
            (self.inner.bus.lock().clone(), self.inner.config_update_topic.lock().clone())
        };
        if let Some(bus) = bus {
            bus.publish(&topic, Payload::ConfigUpdate(update), PublishMetadata::default())
                .await
                .map_err(ModuleError::Bus)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for DashboardShim {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, _fragment: Value) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let status_topic = self.inner.status_topic.lock().clone();
        let analytics_topic = self.inner.analytics_topic.lock().clone();
        let handler = Arc::new(DashboardHandler);
        let mut handles = Vec::new();
        for topic in [status_topic, analytics_topic] {
            let handle = bus
                .subscribe_default(&topic, format!("{}-{}", self.capability.id, topic.as_str()), handler.clone())
                .await
                .map_err(ModuleError::Bus)?;
            handles.push(handle);
        }
        *self.inner.subscriptions.lock() = handles;
        *self.inner.bus.lock() = Some(bus);
        info!(dashboard_id = %self.capability.id, "dashboard shim started");
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

struct DashboardHandler;

#[async_trait]
impl Handler for DashboardHandler {
    async fn handle(&self, _envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}
