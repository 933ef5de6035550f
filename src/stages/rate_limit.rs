//! Rate-limit stage (spec §4.6): per-key token bucket gating an
//! artifact-ready topic, with lazily-created buckets evicted after an
//! idle window.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::config::RateLimitConfig;
use crate::contracts::{Capability, Envelope, HealthStatus, MediaArtifact, ModuleCategory, ModuleState, Payload, PublishMetadata, RateLimitStatus, Topic};
use crate::error::ModuleError;
use crate::orchestrator::Module;

use super::value_as_key_fragment;

/// Replaces the derived topic's last segment with `allowed`, e.g.
/// `event.snapshot.ready` → `event.snapshot.allowed`.
fn derived_topic(source: &str) -> Result<Topic, ModuleError> {
    let mut segments: Vec<&str> = source.split('.').collect();
    if let Some(last) = segments.last_mut() {
        *last = "allowed";
    }
    segments
        .join(".")
        .parse()
        .map_err(|e: crate::error::BusError| ModuleError::ConfigureFailed("rate-limit".into(), e.to_string()))
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    dropped: u64,
}

struct Buckets {
    by_key: HashMap<String, Bucket>,
}

impl Buckets {
    fn new() -> Self {
        Self {
            by_key: HashMap::new(),
        }
    }

    /// Lazily creates the bucket for `key`, refills it for elapsed time
    /// since its last touch, and attempts to consume one token. Returns
    /// `true` if a token was available (message allowed).
    fn try_consume(&mut self, key: String, now: DateTime<Utc>, capacity: f64, refill_per_second: f64) -> bool {
        let bucket = self.by_key.entry(key).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
            dropped: 0,
        });

        let elapsed = now.signed_duration_since(bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            bucket.dropped += 1;
            false
        }
    }

    /// Evicts buckets untouched for longer than `idle_window_seconds`.
    fn evict_idle(&mut self, now: DateTime<Utc>, idle_window_seconds: u64) {
        let idle = chrono::Duration::seconds(idle_window_seconds as i64);
        self.by_key.retain(|_, bucket| now.signed_duration_since(bucket.last_refill) < idle);
    }

    fn dropped_totals(&self) -> HashMap<String, u64> {
        self.by_key.iter().map(|(k, b)| (k.clone(), b.dropped)).collect()
    }
}

/// Default cadence for the `status.rate_limit` drop-counter publisher.
const STATUS_PUBLISH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

struct Inner {
    config: Mutex<RateLimitConfig>,
    source_topic: Topic,
    derived_topic: Topic,
    buckets: Mutex<Buckets>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    status_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    bus: Mutex<Option<BusHandle>>,
}

/// The rate-limit stage. Registered by the orchestrator at boot under
/// module id `rate-limit` (spec §4.6).
pub struct RateLimitModule {
    capability: Capability,
    inner: Arc<Inner>,
}

impl RateLimitModule {
    pub fn new() -> Self {
        let config = RateLimitConfig::default();
        let source_topic: Topic = config.source_topic.parse().expect("default rate-limit source topic is valid");
        let derived = derived_topic(&config.source_topic).expect("default rate-limit source topic derives cleanly");
        Self {
            capability: Capability {
                id: "rate-limit".into(),
                category: ModuleCategory::Processor,
                publishes: vec![derived.clone()],
                subscribes: vec![source_topic.clone()],
                config_fragment_path: "rate_limit".into(),
                restart_on_configure_failure: false,
            },
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                source_topic,
                derived_topic: derived,
                buckets: Mutex::new(Buckets::new()),
                subscription: Mutex::new(None),
                status_task: Mutex::new(None),
                bus: Mutex::new(None),
            }),
        }
    }

    /// Per-key drop counters, reported on `status.rate_limit` (spec §4.6).
    pub fn dropped_totals(&self) -> HashMap<String, u64> {
        self.inner.buckets.lock().dropped_totals()
    }
}

impl Default for RateLimitModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for RateLimitModule {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    #[instrument(skip(self, fragment))]
    async fn configure(&self, fragment: Value) -> Result<(), ModuleError> {
        let config: RateLimitConfig = serde_json::from_value(fragment)
            .map_err(|e| ModuleError::ConfigureFailed("rate-limit".into(), e.to_string()))?;
        let source_topic: Topic = config
            .source_topic
            .parse()
            .map_err(|e: crate::error::BusError| ModuleError::ConfigureFailed("rate-limit".into(), e.to_string()))?;
        let derived = derived_topic(&config.source_topic)?;

        if source_topic != self.inner.source_topic || derived != self.inner.derived_topic {
            return Err(ModuleError::ConfigureFailed(
                "rate-limit".into(),
                "changing source_topic requires a restart".into(),
            ));
        }

        debug!(capacity = config.capacity, refill_per_second = config.refill_per_second, "rate-limit configured");
        *self.inner.config.lock() = config;
        Ok(())
    }

    #[instrument(skip(self, bus))]
    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError> {
        let handler = Arc::new(RateLimitHandler {
            inner: self.inner.clone(),
            bus: bus.clone(),
        });
        let handle = bus
            .subscribe_default(&self.inner.source_topic, "rate-limit", handler)
            .await
            .map_err(ModuleError::Bus)?;
        *self.inner.subscription.lock() = Some(handle);

        let status_topic: Topic = "status.rate_limit".try_into().map_err(ModuleError::Bus)?;
        let inner = self.inner.clone();
        let status_bus = bus.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_PUBLISH_INTERVAL);
            loop {
                ticker.tick().await;
                let dropped_by_key = inner.buckets.lock().dropped_totals();
                let _ = status_bus
                    .publish(
                        &status_topic,
                        Payload::RateLimitStatus(RateLimitStatus {
                            dropped_by_key,
                            sampled_at: Utc::now(),
                        }),
                        PublishMetadata::default(),
                    )
                    .await;
            }
        });
        *self.inner.status_task.lock() = Some(task);
        *self.inner.bus.lock() = Some(bus);

        info!(source = %self.inner.source_topic, derived = %self.inner.derived_topic, "rate-limit started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        if let Some(task) = self.inner.status_task.lock().take() {
            task.abort();
        }
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

struct RateLimitHandler {
    inner: Arc<Inner>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for RateLimitHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::MediaArtifact(artifact) = &envelope.payload else {
            return Ok(());
        };

        let (key_attribute, capacity, refill_per_second, idle_eviction_seconds) = {
            let config = self.inner.config.lock();
            (
                config.key_attribute.clone(),
                config.capacity,
                config.refill_per_second,
                config.idle_eviction_seconds,
            )
        };
        let key = extract_key(artifact, &key_attribute);

        let allowed = {
            let mut buckets = self.inner.buckets.lock();
            buckets.evict_idle(envelope.timestamp, idle_eviction_seconds);
            buckets.try_consume(key.clone(), envelope.timestamp, capacity, refill_per_second)
        };

        if !allowed {
            debug!(key, "artifact dropped by rate limit");
            return Ok(());
        }

        self.bus
            .publish(
                &self.inner.derived_topic,
                Payload::MediaArtifact(artifact.clone()),
                PublishMetadata {
                    correlation_id: envelope.correlation_id,
                },
            )
            .await?;
        Ok(())
    }
}

fn extract_key(artifact: &MediaArtifact, key_attribute: &str) -> String {
    if key_attribute == "camera_id" {
        return artifact.camera_id.clone();
    }
    let value = serde_json::to_value(artifact).unwrap_or(Value::Null);
    value
        .as_object()
        .and_then(|o| o.get(key_attribute).or_else(|| o.get("metadata").and_then(|m| m.get(key_attribute))))
        .and_then(value_as_key_fragment)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_drains() {
        let mut buckets = Buckets::new();
        let t0 = Utc::now();
        assert!(buckets.try_consume("cam1".into(), t0, 2.0, 1.0));
        assert!(buckets.try_consume("cam1".into(), t0, 2.0, 1.0));
        assert!(!buckets.try_consume("cam1".into(), t0, 2.0, 1.0));
        assert_eq!(buckets.by_key.get("cam1").unwrap().dropped, 1);
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut buckets = Buckets::new();
        let t0 = Utc::now();
        assert!(buckets.try_consume("cam1".into(), t0, 1.0, 1.0));
        assert!(!buckets.try_consume("cam1".into(), t0, 1.0, 1.0));
        let t1 = t0 + chrono::Duration::seconds(2);
        assert!(buckets.try_consume("cam1".into(), t1, 1.0, 1.0));
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let mut buckets = Buckets::new();
        let t0 = Utc::now();
        buckets.try_consume("cam1".into(), t0, 1.0, 1.0);
        buckets.evict_idle(t0 + chrono::Duration::seconds(301), 300);
        assert!(buckets.by_key.is_empty());
    }
}
