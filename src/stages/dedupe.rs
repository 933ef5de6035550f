//! Dedupe stage (spec §4.5): suppresses repeated `DetectionEvent`s keyed
//! by configurable attributes within a sliding window, keyed off the
//! envelope timestamp (not wall clock) so replay is deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::config::DedupeConfig;
use crate::contracts::{Capability, DetectionEvent, Envelope, HealthStatus, ModuleCategory, ModuleState, Payload, PublishMetadata, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::value_as_key_fragment;

/// Replaces the derived topic's last segment with `unique`, e.g.
/// `process.motion.detected` → `process.motion.unique`.
fn derived_topic(source: &str) -> Result<Topic, ModuleError> {
    let mut segments: Vec<&str> = source.split('.').collect();
    if let Some(last) = segments.last_mut() {
        *last = "unique";
    }
    segments
        .join(".")
        .parse()
        .map_err(|e: crate::error::BusError| ModuleError::ConfigureFailed("dedupe".into(), e.to_string()))
}

struct Seen {
    /// Insertion-ordered keys, for bounded LRU eviction independent of the
    /// suppression window.
    order: VecDeque<String>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl Seen {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Returns `true` if this key was seen within `window` of `at`, else
    /// records `at` as the new last-seen time and returns `false`.
    fn check_and_record(&mut self, key: String, at: DateTime<Utc>, window: chrono::Duration, capacity: usize) -> bool {
        if let Some(prev) = self.last_seen.get(&key) {
            if at.signed_duration_since(*prev) < window {
                return true;
            }
        }
        if !self.last_seen.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.last_seen.insert(key, at);
        while self.last_seen.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.last_seen.remove(&oldest);
            } else {
                break;
            }
        }
        false
    }
}

struct Inner {
    config: Mutex<DedupeConfig>,
    source_topic: Topic,
    derived_topic: Topic,
    seen: Mutex<Seen>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    bus: Mutex<Option<BusHandle>>,
}

/// The dedupe stage. One instance is registered by the orchestrator at
/// boot under module id `dedupe` (spec §4.5).
pub struct DedupeModule {
    capability: Capability,
    inner: Arc<Inner>,
}

impl DedupeModule {
    pub fn new() -> Self {
        let config = DedupeConfig::default();
        let source_topic: Topic = config.source_topic.parse().expect("default dedupe source topic is valid");
        let derived = derived_topic(&config.source_topic).expect("default dedupe source topic derives cleanly");
        Self {
            capability: Capability {
                id: "dedupe".into(),
                category: ModuleCategory::Processor,
                publishes: vec![derived.clone()],
                subscribes: vec![source_topic.clone()],
                config_fragment_path: "dedupe".into(),
                restart_on_configure_failure: false,
            },
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                source_topic,
                derived_topic: derived,
                seen: Mutex::new(Seen::new()),
                subscription: Mutex::new(None),
                bus: Mutex::new(None),
            }),
        }
    }
}

impl Default for DedupeModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for DedupeModule {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    #[instrument(skip(self, fragment))]
    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let config: DedupeConfig = serde_json::from_value(fragment)
            .map_err(|e| ModuleError::ConfigureFailed("dedupe".into(), e.to_string()))?;
        let source_topic: Topic = config
            .source_topic
            .parse()
            .map_err(|e: crate::error::BusError| ModuleError::ConfigureFailed("dedupe".into(), e.to_string()))?;
        let derived = derived_topic(&config.source_topic)?;

        // `source_topic`/`derived_topic` are fixed at construction time
        // since they define what this module is subscribed to; changing
        // them requires the orchestrator's restart-on-configure-failure
        // path rather than an in-place reconfigure.
        if source_topic != self.inner.source_topic || derived != self.inner.derived_topic {
            return Err(ModuleError::ConfigureFailed(
                "dedupe".into(),
                "changing source_topic requires a restart".into(),
            ));
        }

        debug!(window_seconds = config.window_seconds, "dedupe configured");
        *self.inner.config.lock() = config;
        *self.inner.seen.lock() = Seen::new();
        Ok(())
    }

    #[instrument(skip(self, bus))]
    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let handler = Arc::new(DedupeHandler {
            inner: self.inner.clone(),
            bus: bus.clone(),
        });
        let handle = bus
            .subscribe_default(&self.inner.source_topic, "dedupe", handler)
            .await
            .map_err(ModuleError::Bus)?;
        *self.inner.subscription.lock() = Some(handle);
        *self.inner.bus.lock() = Some(bus);
        info!(source = %self.inner.source_topic, derived = %self.inner.derived_topic, "dedupe started");
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
            ModuleState::Starting
        };
        HealthStatus {
            module_id: self.capability.id.clone(),
            state,
            detail: HashMap::new(),
            last_seen: Utc::now(),
        }
    }
}

struct DedupeHandler {
    inner: Arc<Inner>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for DedupeHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::DetectionEvent(event) = &envelope.payload else {
            return Ok(());
        };

        let (key_attributes, window_seconds, lru_capacity) = {
            let config = self.inner.config.lock();
            (config.key_attributes.clone(), config.window_seconds, config.lru_capacity)
        };
        let key = build_key(event, &key_attributes);
        let window = chrono::Duration::milliseconds((window_seconds * 1000.0) as i64);
        let suppressed = {
            let mut seen = self.inner.seen.lock();
            seen.check_and_record(key, envelope.timestamp, window, lru_capacity)
        };

        if suppressed {
            debug!(camera_id = %event.camera_id, "detection suppressed by dedupe");
            return Ok(());
        }

        self.bus
            .publish(
                &self.inner.derived_topic,
                Payload::DetectionEvent(event.clone()),
                PublishMetadata {
                    correlation_id: envelope.correlation_id,
                },
            )
            .await?;
        Ok(())
    }
}

fn build_key(event: &DetectionEvent, key_attributes: &[String]) -> String {
    let value = serde_json::to_value(event).unwrap_or(Value::Null);
    let object = value.as_object();
    key_attributes
        .iter()
        .map(|attr| {
            let direct = object.and_then(|o| o.get(attr));
            let nested = object
                .and_then(|o| o.get("attributes"))
                .and_then(|a| a.get(attr));
            direct
                .or(nested)
                .and_then(value_as_key_fragment)
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{BoundingBox, DetectionKind};

    fn sample_event(camera_id: &str, label: &str) -> DetectionEvent {
        DetectionEvent {
            camera_id: camera_id.into(),
            timestamp: Utc::now(),
            kind: DetectionKind::Motion,
            label: label.into(),
            confidence: 0.9,
            bbox: BoundingBox::default(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn same_key_within_window_is_suppressed() {
        let mut seen = Seen::new();
        let t0 = Utc::now();
        let window = chrono::Duration::seconds(30);
        assert!(!seen.check_and_record("k".into(), t0, window, 10));
        assert!(seen.check_and_record("k".into(), t0 + chrono::Duration::seconds(5), window, 10));
    }

    #[test]
    fn key_outside_window_is_not_suppressed() {
        let mut seen = Seen::new();
        let t0 = Utc::now();
        let window = chrono::Duration::seconds(30);
        assert!(!seen.check_and_record("k".into(), t0, window, 10));
        assert!(!seen.check_and_record("k".into(), t0 + chrono::Duration::seconds(31), window, 10));
    }

    #[test]
    fn lru_evicts_oldest_beyond_capacity() {
        let mut seen = Seen::new();
        let t0 = Utc::now();
        let window = chrono::Duration::seconds(30);
        seen.check_and_record("a".into(), t0, window, 2);
        seen.check_and_record("b".into(), t0, window, 2);
        seen.check_and_record("c".into(), t0, window, 2);
        assert_eq!(seen.last_seen.len(), 2);
        assert!(!seen.last_seen.contains_key("a"));
    }

    #[test]
    fn build_key_joins_configured_attributes() {
        let event = sample_event("front-door", "person");
        let key = build_key(&event, &["camera_id".to_string(), "kind".to_string(), "label".to_string()]);
        assert_eq!(key, "front-door\u{1f}motion\u{1f}person");
    }
}
