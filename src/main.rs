//! Boot sequence: load config, build the bus, build the orchestrator,
//! register the shim factories, boot the core stages and every
//! configured module, install chaos, start the health loop and the
//! rollback drill, then block until SIGINT/SIGTERM drives a staged
//! shutdown (spec §4.4, §6).

use std::path::PathBuf;
use std::sync::Arc;

use surveillance_core::bus::Bus;
use surveillance_core::chaos::ChaosInterceptor;
use surveillance_core::config::ConfigService;
use surveillance_core::contracts::Topic;
use surveillance_core::error::OrchestratorError;
use surveillance_core::orchestrator::{spawn_drill_loop, spawn_health_loop, Module, Orchestrator, DEFAULT_DRILL_INTERVAL, DEFAULT_HEALTH_POLL_DEADLINE, DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_STOP_DEADLINE, DEFAULT_SUMMARY_INTERVAL};
use surveillance_core::shims::{ArtifactShim, CameraShim, DashboardShim, NotifierShim, ProcessorShim, StorageShim};
use surveillance_core::stages::{DedupeModule, RateLimitModule};
use surveillance_core::telemetry;
use tracing::{error, info};

fn config_dir() -> PathBuf {
    std::env::var("SURVEILLANCE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config"))
}

fn secrets_path() -> PathBuf {
    std::env::var("SURVEILLANCE_SECRETS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config/secrets.toml"))
}

fn register_factories(orchestrator: &Orchestrator) {
    orchestrator.register_factory(
        "camera.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            Ok(Arc::new(CameraShim::new(fragment.id.clone())) as Arc<dyn Module>)
        }),
    );
    orchestrator.register_factory(
        "processor.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            let source: Topic = fragment
                .extra
                .get("source_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("camera.default.frame")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            let detection: Topic = fragment
                .extra
                .get("detection_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("process.motion.detected")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            Ok(Arc::new(ProcessorShim::new(fragment.id.clone(), vec![source], detection)) as Arc<dyn Module>)
        }),
    );
    orchestrator.register_factory(
        "artifact.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            let source: Topic = fragment
                .extra
                .get("source_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("process.motion.unique")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            let artifact: Topic = fragment
                .extra
                .get("artifact_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("event.snapshot.ready")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            Ok(Arc::new(ArtifactShim::new(fragment.id.clone(), source, artifact)) as Arc<dyn Module>)
        }),
    );
    orchestrator.register_factory(
        "notifier.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            let source: Topic = fragment
                .extra
                .get("source_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("event.snapshot.allowed")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            Ok(Arc::new(NotifierShim::new(fragment.id.clone(), source)) as Arc<dyn Module>)
        }),
    );
    orchestrator.register_factory(
        "storage.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            let source: Topic = fragment
                .extra
                .get("source_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("event.snapshot.allowed")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            let storage: Topic = fragment
                .extra
                .get("storage_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("storage.artifacts.written")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            Ok(Arc::new(StorageShim::new(fragment.id.clone(), source, storage)) as Arc<dyn Module>)
        }),
    );
    orchestrator.register_factory(
        "dashboard.sim",
        Arc::new(|fragment: &surveillance_core::config::ModuleFragment| {
            let status: Topic = fragment
                .extra
                .get("status_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("status.health.summary")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            let analytics: Topic = fragment
                .extra
                .get("analytics_topic")
                .and_then(|v| v.as_str())
                .unwrap_or("analytics.summary")
                .parse()
                .map_err(|e: surveillance_core::error::BusError| {
                    surveillance_core::error::ModuleError::ConfigureFailed(fragment.id.clone(), e.to_string())
                })?;
            Ok(Arc::new(DashboardShim::new(fragment.id.clone(), status, analytics)) as Arc<dyn Module>)
        }),
    );
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    telemetry::setup_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "fatal boot failure");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn run() -> Result<(), OrchestratorError> {
    let bus = Bus::spawn();

    let config = ConfigService::load(bus.clone(), config_dir(), secrets_path())
        .await
        .map_err(OrchestratorError::Config)?;
    config
        .spawn_update_listener()
        .await
        .map_err(|e| OrchestratorError::BusInit(e.to_string()))?;

    let orchestrator = Orchestrator::new(bus.clone(), config.clone());
    register_factories(&orchestrator);

    let core_modules: Vec<Arc<dyn Module>> = vec![
        Arc::new(DedupeModule::new()) as Arc<dyn Module>,
        Arc::new(RateLimitModule::new()) as Arc<dyn Module>,
    ];
    orchestrator.boot(core_modules).await?;

    let chaos = ChaosInterceptor::install(bus.clone())
        .await
        .map_err(|e| OrchestratorError::BusInit(e.to_string()))?;
    bus.intercept(chaos).await;

    spawn_health_loop(
        orchestrator.clone(),
        bus.clone(),
        DEFAULT_HEALTH_POLL_INTERVAL,
        DEFAULT_SUMMARY_INTERVAL,
        DEFAULT_HEALTH_POLL_DEADLINE,
    );
    spawn_drill_loop(config.clone(), bus.clone(), DEFAULT_DRILL_INTERVAL);

    info!("surveillance-core running, waiting for shutdown signal");
    wait_for_shutdown_signal().await;

    info!("shutdown signal received");
    orchestrator.shutdown(&bus, DEFAULT_STOP_DEADLINE).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
