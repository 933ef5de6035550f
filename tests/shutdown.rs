//! Staged shutdown ordering (spec §4.4, §8 scenario 6): modules stop in
//! `Input → Processor → EventBuilder → Output → Storage → Dashboard →
//! Core` order, never interleaved across phases.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use surveillance_core::bus::{Bus, BusHandle};
use surveillance_core::config::ConfigService;
use surveillance_core::contracts::{Capability, HealthStatus, ModuleCategory, ModuleState};
use surveillance_core::error::ModuleError;
use surveillance_core::orchestrator::{Module, Orchestrator, DEFAULT_STOP_DEADLINE};

struct RecordingModule {
    capability: Capability,
    stop_order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Module for RecordingModule {
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
        self.stop_order.lock().unwrap().push(self.capability.id.clone());
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

fn module(id: &str, category: ModuleCategory, stop_order: Arc<Mutex<Vec<String>>>) -> Arc<dyn Module> {
    Arc::new(RecordingModule {
        capability: Capability {
            id: id.into(),
            category,
            publishes: vec![],
            subscribes: vec![],
            config_fragment_path: id.into(),
            restart_on_configure_failure: false,
        },
        stop_order,
    }) as Arc<dyn Module>
}

#[tokio::test]
async fn shutdown_stops_modules_in_category_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Bus::spawn();
    let config = ConfigService::load(bus.clone(), dir.path().join("config"), dir.path().join("secrets.toml"))
        .await
        .unwrap();
    let orchestrator = Orchestrator::new(bus.clone(), config.clone());

    let stop_order = Arc::new(Mutex::new(Vec::new()));

    // Registered in a deliberately scrambled order so any pass-through of
    // registration order (rather than category rank) would be caught.
    let core_modules = vec![
        module("dash", ModuleCategory::Dashboard, stop_order.clone()),
        module("core-svc", ModuleCategory::Core, stop_order.clone()),
        module("store", ModuleCategory::Storage, stop_order.clone()),
        module("cam", ModuleCategory::Input, stop_order.clone()),
        module("notify", ModuleCategory::Output, stop_order.clone()),
        module("builder", ModuleCategory::EventBuilder, stop_order.clone()),
        module("proc", ModuleCategory::Processor, stop_order.clone()),
    ];
    orchestrator.boot(core_modules).await.unwrap();

    orchestrator.shutdown(&bus, DEFAULT_STOP_DEADLINE).await;

    let order = stop_order.lock().unwrap().clone();
    assert_eq!(order, vec!["cam", "proc", "builder", "notify", "store", "dash", "core-svc"]);
}
