//! # Orchestrator
//!
//! Module lifecycle: boot order, config-driven reconfiguration, health
//! polling, staged shutdown (spec §4.4).
//!
//! Grounded on `lifecycle/order_system.rs::OrderSystem::new`'s explicit
//! two-phase "construct every actor, then wire clients between them, then
//! spawn" sequence, generalized from three hardcoded actors to an id-keyed
//! registry of `dyn Module` driven by `ConfigTree` fragments plus a
//! factory lookup by fragment `type`.

pub mod drill;
pub mod health;
pub mod module;
pub mod shutdown;

pub use drill::{spawn_drill_loop, DEFAULT_DRILL_INTERVAL};
pub use health::{spawn_health_loop, DEFAULT_HEALTH_POLL_DEADLINE, DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_SUMMARY_INTERVAL};
pub use module::{LifecyclePhase, Module, ModuleRecord};
pub use shutdown::DEFAULT_STOP_DEADLINE;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::config::{ConfigService, ModuleFragment};
use crate::contracts::{
    Capability, ConfigRollbackPayload, Envelope, ModuleCategory, Payload, PublishMetadata, Topic,
};
use crate::error::{ModuleError, OrchestratorError};

/// Builds a `dyn Module` from one configured fragment. Registered per
/// fragment `type` string (spec §4.1: "the configuration fragment path it
/// owns").
pub type ModuleFactory = Arc<dyn Fn(&ModuleFragment) -> Result<Arc<dyn Module>, ModuleError> + Send + Sync>;

const DEFAULT_CONFIGURE_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_START_DEADLINE: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    bus: BusHandle,
    config: Arc<ConfigService>,
    factories: Mutex<HashMap<String, ModuleFactory>>,
    registry: Mutex<HashMap<String, ModuleRecord>>,
    configure_deadline: Duration,
    start_deadline: Duration,
}

impl Orchestrator {
    pub fn new(bus: BusHandle, config: Arc<ConfigService>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            factories: Mutex::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
            configure_deadline: DEFAULT_CONFIGURE_DEADLINE,
            start_deadline: DEFAULT_START_DEADLINE,
        })
    }

    /// Registers the constructor for one fragment `type` string. Core
    /// stages (dedupe, rate-limit) are instantiated directly in `boot`
    /// rather than through this registry, since they have no `type` field
    /// to dispatch on.
    pub fn register_factory(&self, type_name: impl Into<String>, factory: ModuleFactory) {
        self.factories.lock().insert(type_name.into(), factory);
    }

    /// Instantiates the core stages plus every configured fragment across
    /// all seven pluggable sections, driving each through
    /// `configure` → `start` in category order, then subscribes to
    /// `config.snapshot` to drive reconfiguration on every future change
    /// (spec §4.4).
    #[instrument(skip(self, core_modules))]
    pub async fn boot(
        self: &Arc<Self>,
        core_modules: Vec<Arc<dyn Module>>,
    ) -> Result<SubscriptionHandle, OrchestratorError> {
        let tree = self.config.current_tree();

        for module in core_modules {
            let fragment = match module.capability().id.as_str() {
                "dedupe" => serde_json::to_value(&tree.dedupe).expect("DedupeConfig serializes"),
                "rate-limit" => serde_json::to_value(&tree.rate_limit).expect("RateLimitConfig serializes"),
                other => serde_json::json!({ "id": other }),
            };
            self.register_and_start(module, fragment).await?;
        }

        for (section, fragments) in [
            ("cameras", &tree.cameras),
            ("process", &tree.process),
            ("event", &tree.event),
            ("outputs", &tree.outputs),
            ("storage", &tree.storage),
            ("analytics", &tree.analytics),
            ("dashboards", &tree.dashboards),
        ] {
            for fragment in fragments {
                self.instantiate_and_start(section, fragment).await?;
            }
        }

        for record in self.registry.lock().values() {
            record
                .module
                .capability()
                .validate_domains()
                .map_err(OrchestratorError::BusInit)?;
        }

        let topic: Topic = "config.snapshot"
            .try_into()
            .map_err(|e: crate::error::BusError| OrchestratorError::BusInit(e.to_string()))?;
        let handle = self
            .bus
            .subscribe_default(&topic, "orchestrator", Arc::new(ReconfigureHandler { orchestrator: self.clone() }))
            .await
            .map_err(|e| OrchestratorError::BusInit(e.to_string()))?;

        info!(modules = self.registry.lock().len(), "orchestrator booted");
        Ok(handle)
    }

    async fn instantiate_and_start(&self, section: &str, fragment: &ModuleFragment) -> Result<(), OrchestratorError> {
        if self.registry.lock().contains_key(&fragment.id) {
            return Err(OrchestratorError::DuplicateModuleId(fragment.id.clone()));
        }
        let factory = self
            .factories
            .lock()
            .get(&fragment.type_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownFactory(fragment.type_name.clone()))?;
        let module = factory(fragment).map_err(OrchestratorError::Module)?;
        let value = serde_json::to_value(fragment).map_err(|e| {
            OrchestratorError::Module(ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string()))
        })?;
        info!(section, module_id = %fragment.id, type_name = %fragment.type_name, "instantiated module");
        self.register_and_start(module, value).await
    }

    async fn register_and_start(&self, module: Arc<dyn Module>, fragment: Value) -> Result<(), OrchestratorError> {
        let capability = module.capability().clone();
        if self.registry.lock().contains_key(&capability.id) {
            return Err(OrchestratorError::DuplicateModuleId(capability.id));
        }

        tokio::time::timeout(self.configure_deadline, module.configure(fragment.clone()))
            .await
            .map_err(|_| ModuleError::ConfigureFailed(capability.id.clone(), "configure deadline exceeded".into()))?
            .map_err(OrchestratorError::Module)?;

        tokio::time::timeout(self.start_deadline, module.start(self.bus.clone()))
            .await
            .map_err(|_| ModuleError::StartFailed(capability.id.clone(), "start deadline exceeded".into()))?
            .map_err(OrchestratorError::Module)?;

        self.registry.lock().insert(
            capability.id.clone(),
            ModuleRecord {
                module,
                phase: LifecyclePhase::Running,
                category: capability.category,
                restart_on_configure_failure: capability.restart_on_configure_failure,
                fragment,
                last_health: None,
            },
        );
        Ok(())
    }

    /// Computes the id→fragment map a `config.snapshot` implies: the two
    /// core stages plus every fragment across the pluggable sections (spec
    /// §4.4: "computes a per-module diff against the previous snapshot").
    fn fragments_by_id(tree: &crate::config::ConfigTree) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "dedupe".to_string(),
            serde_json::to_value(&tree.dedupe).expect("DedupeConfig serializes"),
        );
        map.insert(
            "rate-limit".to_string(),
            serde_json::to_value(&tree.rate_limit).expect("RateLimitConfig serializes"),
        );
        for fragments in [
            &tree.cameras,
            &tree.process,
            &tree.event,
            &tree.outputs,
            &tree.storage,
            &tree.analytics,
            &tree.dashboards,
        ] {
            for fragment in fragments {
                if let Ok(value) = serde_json::to_value(fragment) {
                    map.insert(fragment.id.clone(), value);
                }
            }
        }
        map
    }

    /// Reacts to a new config snapshot: every module whose owned fragment
    /// changed is reconfigured in place. On `configure` failure the
    /// fragment is reverted, the module marked `degraded` in the cached
    /// health, a module-scoped `ConfigRollbackPayload` is published, and —
    /// if `restart_on_configure_failure` is set — the module is driven
    /// through `stop` → `configure` → `start` again with its prior
    /// fragment (spec §4.4).
    #[instrument(skip(self, tree))]
    async fn reconfigure(self: &Arc<Self>, tree: crate::config::ConfigTree) {
        let incoming = Self::fragments_by_id(&tree);
        let changed: Vec<(String, Value, Value)> = {
            let registry = self.registry.lock();
            incoming
                .iter()
                .filter_map(|(id, new_fragment)| {
                    let record = registry.get(id)?;
                    if &record.fragment != new_fragment {
                        Some((id.clone(), record.fragment.clone(), new_fragment.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (id, old_fragment, new_fragment) in changed {
            self.reconfigure_one(&id, old_fragment, new_fragment).await;
        }
    }

    async fn reconfigure_one(self: &Arc<Self>, id: &str, old_fragment: Value, new_fragment: Value) {
        let module = {
            let registry = self.registry.lock();
            registry.get(id).map(|r| r.module.clone())
        };
        let Some(module) = module else { return };

        match tokio::time::timeout(self.configure_deadline, module.configure(new_fragment.clone())).await {
            Ok(Ok(())) => {
                let mut registry = self.registry.lock();
                if let Some(record) = registry.get_mut(id) {
                    record.fragment = new_fragment;
                }
                info!(module_id = id, "module reconfigured");
            }
            Ok(Err(e)) => {
                self.fail_reconfigure(id, old_fragment, e.to_string()).await;
            }
            Err(_) => {
                self.fail_reconfigure(id, old_fragment, "configure deadline exceeded".into()).await;
            }
        }
    }

    async fn fail_reconfigure(self: &Arc<Self>, id: &str, old_fragment: Value, reason: String) {
        warn!(module_id = id, reason = %reason, "reconfigure failed, reverting fragment");

        let restart = {
            let registry = self.registry.lock();
            registry.get(id).map(|r| r.restart_on_configure_failure).unwrap_or(false)
        };

        let topic_result: Result<Topic, crate::error::BusError> = "config.snapshot".try_into();
        if let Ok(topic) = topic_result {
            let version = self.config.current_version();
            let _ = self
                .bus
                .publish(
                    &topic,
                    Payload::ConfigRollback(ConfigRollbackPayload {
                        previous_version: version,
                        current_version: version,
                        diagnostics: reason.clone(),
                        module_id: Some(id.to_string()),
                    }),
                    PublishMetadata::default(),
                )
                .await;
        }

        if restart {
            let module = {
                let registry = self.registry.lock();
                registry.get(id).map(|r| r.module.clone())
            };
            if let Some(module) = module {
                let _ = module.stop().await;
                if module.configure(old_fragment.clone()).await.is_ok() {
                    let _ = module.start(self.bus.clone()).await;
                }
            }
        }

        let mut registry = self.registry.lock();
        if let Some(record) = registry.get_mut(id) {
            record.fragment = old_fragment;
            record.last_health = Some(crate::contracts::HealthStatus {
                module_id: id.to_string(),
                state: crate::contracts::ModuleState::Degraded,
                detail: [("reason".to_string(), serde_json::Value::String(reason))].into(),
                last_seen: chrono::Utc::now(),
            });
        }
    }
}

struct ReconfigureHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl Handler for ReconfigureHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Payload::ConfigSnapshot(snapshot) = &envelope.payload {
            match serde_json::from_value::<crate::config::ConfigTree>(snapshot.tree.clone()) {
                Ok(tree) => self.orchestrator.reconfigure(tree).await,
                Err(e) => warn!(error = %e, "failed to parse config.snapshot for reconfiguration"),
            }
        }
        Ok(())
    }
}

/// Boot-time category-ordering check, used by callers assembling the core
/// module set before `boot` (spec §4.4 lists input→processor→event_builder
/// →output/storage→dashboard→core as the *shutdown* order; boot order is
/// the reverse, core first).
pub fn boot_order() -> [ModuleCategory; 7] {
    [
        ModuleCategory::Core,
        ModuleCategory::Input,
        ModuleCategory::Processor,
        ModuleCategory::EventBuilder,
        ModuleCategory::Output,
        ModuleCategory::Storage,
        ModuleCategory::Dashboard,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::contracts::HealthStatus;
    use async_trait::async_trait as at;

    struct NoopModule {
        capability: Capability,
    }

    #[at]
    impl Module for NoopModule {
        fn capability(&self) -> &Capability {
            &self.capability
        }
        async fn configure(&self, _fragment: Value) -> Result<(), ModuleError> {
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
                state: crate::contracts::ModuleState::Healthy,
                detail: HashMap::new(),
                last_seen: chrono::Utc::now(),
            }
        }
    }

    #[tokio::test]
    async fn boot_registers_and_starts_core_module() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let config = crate::config::ConfigService::load(bus.clone(), dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(bus, config);

        let core = vec![Arc::new(NoopModule {
            capability: Capability {
                id: "dedupe".into(),
                category: ModuleCategory::Core,
                publishes: vec![],
                subscribes: vec![],
                config_fragment_path: "dedupe".into(),
                restart_on_configure_failure: false,
            },
        }) as Arc<dyn Module>];

        let handle = orchestrator.boot(core).await.unwrap();
        assert!(orchestrator.registry.lock().contains_key("dedupe"));
        orchestrator.bus.unsubscribe(handle).await.unwrap();
    }
}
