//! Telemetry sampler (spec §4.2): samples every subscription at a fixed
//! cadence and publishes `BusStatus` on `status.bus`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::contracts::{BusStatus, Payload, PublishMetadata, SubscriptionStatus, Topic};

use super::subscription::Subscription;
use super::BusHandle;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the periodic `status.bus` sampler. Returns the task handle so the
/// orchestrator can include it among the "core services" shut down last.
pub fn spawn_sampler(
    bus: BusHandle,
    registry: Arc<Mutex<Vec<Arc<Subscription>>>>,
    published_total: Arc<AtomicU64>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let topic: Topic = "status.bus".try_into().expect("status.bus is a reserved topic");
        loop {
            ticker.tick().await;
            let subs: Vec<SubscriptionStatus> = {
                let guard = registry.lock();
                guard
                    .iter()
                    .map(|s| SubscriptionStatus {
                        subscriber_id: s.subscriber_id.clone(),
                        topic: s.topic.clone(),
                        depth: s.queue.depth(),
                        capacity: s.capacity,
                        delivered: s.delivered.load(Ordering::Relaxed),
                        dropped: s.dropped.load(Ordering::Relaxed),
                        oldest_enqueued_age_ms: s.queue.oldest_enqueued_at().map(|ts| {
                            (Utc::now() - ts).num_milliseconds().max(0)
                        }),
                        degraded: s.degraded.load(Ordering::Relaxed),
                    })
                    .collect()
            };
            let status = BusStatus {
                published_total: published_total.load(Ordering::Relaxed),
                subscriptions: subs,
                sampled_at: Utc::now(),
            };
            if let Err(e) = bus
                .publish(&topic, Payload::BusStatus(status), PublishMetadata::default())
                .await
            {
                warn!(error = %e, "failed to publish BusStatus");
            }
        }
    })
}
