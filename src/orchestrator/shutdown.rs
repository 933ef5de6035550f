//! Staged shutdown (spec §4.4): inputs, then processors, then event
//! builders, then outputs/storage, then dashboards, then core services.
//!
//! Grounded on `lifecycle/order_system.rs::shutdown`'s
//! drop-clients-then-await-join-handles-then-report shape, generalized
//! from one flat phase to the spec's ordered phase list, each phase
//! bounded by the same per-module stop deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bus::BusHandle;
use crate::contracts::{ModuleCategory, Payload, PublishMetadata, ShutdownProgress, Topic};

use super::module::LifecyclePhase;
use super::Orchestrator;

/// Default per-module stop deadline (spec §5).
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(10);

const PHASE_ORDER: [ModuleCategory; 6] = [
    ModuleCategory::Input,
    ModuleCategory::Processor,
    ModuleCategory::EventBuilder,
    ModuleCategory::Output,
    ModuleCategory::Storage,
    ModuleCategory::Dashboard,
];

impl Orchestrator {
    /// Drives every registered module through `stop()` in shutdown-rank
    /// order, publishing one `ShutdownProgress` per phase, then stops core
    /// services last (spec §4.4).
    pub async fn shutdown(self: &Arc<Self>, bus: &BusHandle, stop_deadline: Duration) {
        let start = Instant::now();
        let topic: Topic = "status.shutdown.progress"
            .try_into()
            .expect("status.shutdown.progress is a reserved topic");

        for &category in PHASE_ORDER.iter().chain([&ModuleCategory::Core]) {
            let ids: Vec<String> = {
                let registry = self.registry.lock();
                registry
                    .iter()
                    .filter(|(_, r)| r.category == category && r.phase == LifecyclePhase::Running)
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            if ids.is_empty() {
                continue;
            }

            info!(phase = category.phase_name(), modules = ids.len(), "shutdown phase starting");
            let remaining_after = {
                let registry = self.registry.lock();
                registry
                    .values()
                    .filter(|r| r.phase == LifecyclePhase::Running)
                    .count()
            };
            let _ = bus
                .publish(
                    &topic,
                    Payload::ShutdownProgress(ShutdownProgress {
                        phase: category.phase_name().to_string(),
                        modules_remaining: remaining_after,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    }),
                    PublishMetadata::default(),
                )
                .await;

            for id in ids {
                self.stop_one(&id, stop_deadline).await;
            }
        }

        info!(elapsed_ms = start.elapsed().as_millis() as u64, "shutdown complete");
    }

    async fn stop_one(&self, id: &str, deadline: Duration) {
        let module = {
            let registry = self.registry.lock();
            registry.get(id).map(|r| r.module.clone())
        };
        let Some(module) = module else { return };

        match tokio::time::timeout(deadline, module.stop()).await {
            Ok(Ok(())) => {
                let mut registry = self.registry.lock();
                if let Some(record) = registry.get_mut(id) {
                    record.phase = LifecyclePhase::Stopped;
                }
                info!(module_id = id, "module stopped");
            }
            Ok(Err(e)) => {
                warn!(module_id = id, error = %e, "module stop failed");
                let mut registry = self.registry.lock();
                if let Some(record) = registry.get_mut(id) {
                    record.phase = LifecyclePhase::Stopped;
                }
            }
            Err(_) => {
                warn!(module_id = id, "module stop exceeded deadline (ShutdownDeadlineExceeded)");
                let mut registry = self.registry.lock();
                if let Some(record) = registry.get_mut(id) {
                    record.phase = LifecyclePhase::Error;
                    record.last_health = Some(crate::contracts::HealthStatus {
                        module_id: id.to_string(),
                        state: crate::contracts::ModuleState::Error,
                        detail: [(
                            "reason".to_string(),
                            serde_json::Value::String("stop exceeded deadline, abandoned".to_string()),
                        )]
                        .into(),
                        last_seen: chrono::Utc::now(),
                    });
                }
            }
        }
    }
}
