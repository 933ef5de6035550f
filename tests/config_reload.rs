//! Orchestrator reconfiguration behavior driven by real `config.snapshot`
//! traffic (spec §4.4, §8 scenarios 4 & 5): a changed fragment is
//! reconfigured in place, and a module that fails `configure` and opts
//! into `restart_on_configure_failure` is cycled through stop→configure→
//! start with its prior fragment restored.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use surveillance_core::bus::{Bus, BusHandle};
use surveillance_core::config::ConfigService;
use surveillance_core::contracts::{Capability, ConfigUpdate, HealthStatus, ModuleCategory, ModuleState};
use surveillance_core::error::ModuleError;
use surveillance_core::orchestrator::{Module, Orchestrator};

struct TestModule {
    capability: Capability,
    configure_calls: Arc<AtomicUsize>,
    start_calls: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    fail_next_configure: Arc<AtomicBool>,
}

#[async_trait]
impl Module for TestModule {
    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn configure(&self, _fragment: Value) -> Result<(), ModuleError> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_configure.swap(false, Ordering::SeqCst) {
            return Err(ModuleError::ConfigureFailed(self.capability.id.clone(), "forced failure".into()));
        }
        Ok(())
    }

    async fn start(&self, _bus: BusHandle) -> Result<(), ModuleError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            module_id: self.capability.id.clone(),
            state: ModuleState::Healthy,
            detail: Default::default(),
            last_seen: chrono::Utc::now(),
        }
    }
}

/// Polls `predicate` until it's true or `timeout` elapses, for asserting on
/// state mutated by the orchestrator's asynchronous reconfigure path.
async fn wait_for(predicate: impl Fn() -> bool, timeout: std::time::Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout: {what}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn reconfigures_in_place_on_changed_fragment() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::spawn();
    let config = ConfigService::load(bus.clone(), dir.path().join("config"), dir.path().join("secrets.toml"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(bus.clone(), config.clone());

    let configure_calls = Arc::new(AtomicUsize::new(0));
    let start_calls = Arc::new(AtomicUsize::new(0));
    let stop_calls = Arc::new(AtomicUsize::new(0));
    let fail_next_configure = Arc::new(AtomicBool::new(false));
    {
        let configure_calls = configure_calls.clone();
        let start_calls = start_calls.clone();
        let stop_calls = stop_calls.clone();
        let fail_next_configure = fail_next_configure.clone();
        orchestrator.register_factory(
            "test.module",
            Arc::new(move |fragment| {
                Ok(Arc::new(TestModule {
                    capability: Capability {
                        id: fragment.id.clone(),
                        category: ModuleCategory::Input,
                        publishes: vec![],
                        subscribes: vec![],
                        config_fragment_path: "cameras".into(),
                        restart_on_configure_failure: false,
                    },
                    configure_calls: configure_calls.clone(),
                    start_calls: start_calls.clone(),
                    stop_calls: stop_calls.clone(),
                    fail_next_configure: fail_next_configure.clone(),
                }) as Arc<dyn Module>)
            }),
        );
    }

    let outcome = config
        .apply_changes(vec![ConfigUpdate {
            path: "cameras".into(),
            value: serde_json::json!([{"id": "cam-a", "type": "test.module"}]),
            requester: "test".into(),
        }])
        .await;
    assert!(matches!(outcome, surveillance_core::config::ApplyOutcome::Committed { .. }));

    orchestrator.boot(vec![]).await.unwrap();
    assert_eq!(configure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(start_calls.load(Ordering::SeqCst), 1);

    let outcome = config
        .apply_changes(vec![ConfigUpdate {
            path: "cameras".into(),
            value: serde_json::json!([{"id": "cam-a", "type": "test.module", "note": "v2"}]),
            requester: "test".into(),
        }])
        .await;
    assert!(matches!(outcome, surveillance_core::config::ApplyOutcome::Committed { .. }));

    wait_for(
        || configure_calls.load(Ordering::SeqCst) == 2,
        std::time::Duration::from_secs(2),
        "module reconfigured in place",
    )
    .await;
    assert_eq!(start_calls.load(Ordering::SeqCst), 1, "no restart should happen on a successful reconfigure");
    assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn restarts_the_module_when_configure_fails_and_restart_is_opted_in() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::spawn();
    let config = ConfigService::load(bus.clone(), dir.path().join("config"), dir.path().join("secrets.toml"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(bus.clone(), config.clone());

    let configure_calls = Arc::new(AtomicUsize::new(0));
    let start_calls = Arc::new(AtomicUsize::new(0));
    let stop_calls = Arc::new(AtomicUsize::new(0));
    let fail_next_configure = Arc::new(AtomicBool::new(false));
    {
        let configure_calls = configure_calls.clone();
        let start_calls = start_calls.clone();
        let stop_calls = stop_calls.clone();
        let fail_next_configure = fail_next_configure.clone();
        orchestrator.register_factory(
            "test.module",
            Arc::new(move |fragment| {
                Ok(Arc::new(TestModule {
                    capability: Capability {
                        id: fragment.id.clone(),
                        category: ModuleCategory::Input,
                        publishes: vec![],
                        subscribes: vec![],
                        config_fragment_path: "cameras".into(),
                        restart_on_configure_failure: true,
                    },
                    configure_calls: configure_calls.clone(),
                    start_calls: start_calls.clone(),
                    stop_calls: stop_calls.clone(),
                    fail_next_configure: fail_next_configure.clone(),
                }) as Arc<dyn Module>)
            }),
        );
    }

    config
        .apply_changes(vec![ConfigUpdate {
            path: "cameras".into(),
            value: serde_json::json!([{"id": "cam-b", "type": "test.module"}]),
            requester: "test".into(),
        }])
        .await;
    orchestrator.boot(vec![]).await.unwrap();
    assert_eq!(configure_calls.load(Ordering::SeqCst), 1);
    assert_eq!(start_calls.load(Ordering::SeqCst), 1);

    fail_next_configure.store(true, Ordering::SeqCst);
    config
        .apply_changes(vec![ConfigUpdate {
            path: "cameras".into(),
            value: serde_json::json!([{"id": "cam-b", "type": "test.module", "note": "v2"}]),
            requester: "test".into(),
        }])
        .await;

    wait_for(
        || start_calls.load(Ordering::SeqCst) == 2,
        std::time::Duration::from_secs(2),
        "module restarted after a failed reconfigure",
    )
    .await;
    assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(configure_calls.load(Ordering::SeqCst), 3, "failed attempt plus the restart's configure with the old fragment");
}
