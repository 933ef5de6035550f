//! # ConfigService
//!
//! Typed layered configuration: defaults, environment overrides,
//! environment variables, secrets (spec §4.3). Owns the snapshot,
//! serializes updates through `apply_changes`, and broadcasts on
//! `config.snapshot` / `status.contract`.
//!
//! Unlike the Bus, `ConfigService` is not an actor: spec §5 says updates
//! are "serialized through a single update-handler task so no explicit
//! lock is visible to modules" — that single task is the bus consumer
//! task `subscribe_updates` spawns, so a `parking_lot::Mutex`-guarded
//! struct is sufficient (the lock is never contended because only one
//! caller path exists at a time), the same reasoning the teacher applies
//! when it lets `ResourceActor` be the only mutator of its store.

pub mod persistence;
pub mod secrets;
pub mod snapshot;

pub use persistence::{fingerprint, SnapshotEntry, SnapshotHistory, MAX_HISTORY};
pub use secrets::{strip_secrets_prefix, Secrets};
pub use snapshot::{set_dotted, ConfigTree, DedupeConfig, ModuleFragment, RateLimitConfig};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::bus::{BusHandle, Handler, SubscriptionHandle};
use crate::contracts::{
    ConfigDiagnostic, ConfigRejected, ConfigRollbackPayload, ConfigUpdate, Envelope, Payload,
    PublishMetadata, Topic,
};
use crate::error::{BusError, ConfigError};

const ENV_PREFIX: &str = "SURVEILLANCE_";

/// Outcome of one `apply_changes` call (spec §4.3: commit or reject).
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Committed { version: u64 },
    Rejected { diagnostics: Vec<ConfigDiagnostic> },
    NoOp { version: u64 },
}

struct ConfigState {
    tree: ConfigTree,
    version: u64,
    history: SnapshotHistory,
}

pub struct ConfigService {
    inner: Mutex<ConfigState>,
    bus: BusHandle,
    secrets: Secrets,
    #[allow(dead_code)]
    config_dir: PathBuf,
}

impl ConfigService {
    /// Loads defaults, then `config.toml`, then `config.<environment>.toml`,
    /// then `SURVEILLANCE_*` environment variables, then resolves every
    /// fragment's `token_ref` against the secrets document. Publishes the
    /// version-1 snapshot before returning.
    #[instrument(skip(bus))]
    pub async fn load(
        bus: BusHandle,
        config_dir: impl Into<PathBuf>,
        secrets_path: impl Into<PathBuf>,
    ) -> Result<Arc<Self>, ConfigError> {
        let config_dir = config_dir.into();
        let secrets_path = secrets_path.into();

        let mut tree_value =
            serde_json::to_value(ConfigTree::default()).expect("default tree always serializes");
        merge_toml_file_into(&mut tree_value, &config_dir.join("config.toml"))?;

        let environment = tree_value
            .get("system")
            .and_then(|s| s.get("environment"))
            .and_then(|e| e.as_str())
            .unwrap_or("development")
            .to_string();
        merge_toml_file_into(&mut tree_value, &config_dir.join(format!("config.{environment}.toml")))?;

        apply_env_overrides(&mut tree_value)?;

        let tree: ConfigTree =
            serde_json::from_value(tree_value).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let secrets = Secrets::load(&secrets_path)?;
        for fragment in tree.all_fragments() {
            if let Some(token_ref) = &fragment.token_ref {
                secrets.resolve(strip_secrets_prefix(token_ref))?;
            }
        }

        let diagnostics = tree.validate();
        if !diagnostics.is_empty() {
            let message = diagnostics
                .iter()
                .map(|d| format!("{}: {}", d.field, d.reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::Invalid(message));
        }

        let mut history = SnapshotHistory::load(&config_dir)?;
        let version = 1;
        let payload = tree.to_snapshot_payload(version)?;
        let fp = fingerprint(&payload.tree)?;
        history.push(SnapshotEntry {
            version,
            fingerprint: fp,
            payload: payload.tree.clone(),
            timestamp: Utc::now(),
        })?;

        let topic = snapshot_topic()?;
        let service = Arc::new(Self {
            inner: Mutex::new(ConfigState {
                tree,
                version,
                history,
            }),
            bus: bus.clone(),
            secrets,
            config_dir,
        });
        bus.publish(&topic, Payload::ConfigSnapshot(payload), PublishMetadata::default())
            .await
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        info!(version, environment, "config loaded");
        Ok(service)
    }

    pub fn current_version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn current_tree(&self) -> ConfigTree {
        self.inner.lock().tree.clone()
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn current_fingerprint(&self) -> Result<String, ConfigError> {
        let guard = self.inner.lock();
        let payload = guard.tree.to_snapshot_payload(guard.version)?;
        fingerprint(&payload.tree)
    }

    /// Subscribes to `config.update` so the orchestrator's reconfiguration
    /// path is driven by accepted updates arriving on the bus (spec §4.3).
    pub async fn spawn_update_listener(self: &Arc<Self>) -> Result<SubscriptionHandle, BusError> {
        let topic: Topic = "config.update".try_into()?;
        self.bus
            .subscribe_default(&topic, "config-service", Arc::new(ConfigUpdateHandler { service: self.clone() }))
            .await
    }

    /// Applies a batch of dotted-path updates atomically: all succeed or
    /// none do (spec §4.3, §8 invariant: "advances the snapshot version by
    /// exactly 1 or leaves it unchanged").
    #[instrument(skip(self, updates))]
    pub async fn apply_changes(&self, updates: Vec<ConfigUpdate>) -> ApplyOutcome {
        if updates.is_empty() {
            return ApplyOutcome::NoOp {
                version: self.inner.lock().version,
            };
        }

        let (working, prev_version) = {
            let guard = self.inner.lock();
            let mut working =
                serde_json::to_value(&guard.tree).expect("ConfigTree always serializes");
            for update in &updates {
                if let Err(e) = set_dotted(&mut working, &update.path, update.value.clone()) {
                    let diagnostics = vec![ConfigDiagnostic {
                        field: update.path.clone(),
                        reason: e.to_string(),
                    }];
                    return self.reject(diagnostics).await;
                }
            }
            (working, guard.version)
        };

        let new_tree: ConfigTree = match serde_json::from_value(working) {
            Ok(tree) => tree,
            Err(e) => {
                return self
                    .reject(vec![ConfigDiagnostic {
                        field: "<root>".into(),
                        reason: e.to_string(),
                    }])
                    .await
            }
        };

        let diagnostics = new_tree.validate();
        if !diagnostics.is_empty() {
            return self.reject(diagnostics).await;
        }

        let new_version = prev_version + 1;
        let payload = match new_tree.to_snapshot_payload(new_version) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .reject(vec![ConfigDiagnostic {
                        field: "<root>".into(),
                        reason: e.to_string(),
                    }])
                    .await
            }
        };
        let fp = match fingerprint(&payload.tree) {
            Ok(fp) => fp,
            Err(e) => {
                return self
                    .reject(vec![ConfigDiagnostic {
                        field: "<root>".into(),
                        reason: e.to_string(),
                    }])
                    .await
            }
        };

        {
            let mut guard = self.inner.lock();
            guard.tree = new_tree;
            guard.version = new_version;
            if let Err(e) = guard.history.push(SnapshotEntry {
                version: new_version,
                fingerprint: fp,
                payload: payload.tree.clone(),
                timestamp: Utc::now(),
            }) {
                warn!(error = %e, "failed to persist snapshot history");
            }
        }

        match snapshot_topic() {
            Ok(topic) => {
                if let Err(e) = self
                    .bus
                    .publish(&topic, Payload::ConfigSnapshot(payload), PublishMetadata::default())
                    .await
                {
                    warn!(error = %e, "failed to publish config.snapshot");
                }
            }
            Err(e) => warn!(error = %e, "invalid config.snapshot topic"),
        }

        info!(version = new_version, "config applied");
        ApplyOutcome::Committed { version: new_version }
    }

    /// Restores a previous snapshot from the bounded history (spec §4.3).
    #[instrument(skip(self))]
    pub async fn rollback(&self, version: u64) -> Result<u64, ConfigError> {
        let (entry, prev_version) = {
            let guard = self.inner.lock();
            let entry = guard
                .history
                .get(version)
                .cloned()
                .ok_or(ConfigError::UnknownVersion(version))?;
            (entry, guard.version)
        };

        let tree: ConfigTree =
            serde_json::from_value(entry.payload.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let new_version = prev_version + 1;
        let payload = tree.to_snapshot_payload(new_version)?;
        let fp = fingerprint(&payload.tree)?;

        {
            let mut guard = self.inner.lock();
            guard.tree = tree;
            guard.version = new_version;
            guard.history.push(SnapshotEntry {
                version: new_version,
                fingerprint: fp,
                payload: payload.tree.clone(),
                timestamp: Utc::now(),
            })?;
        }

        let rollback_payload = ConfigRollbackPayload {
            previous_version: prev_version,
            current_version: new_version,
            diagnostics: format!("rolled back to snapshot version {version}"),
            module_id: None,
        };
        let rollback_topic: Topic = "config.snapshot".try_into().map_err(|e: BusError| ConfigError::Invalid(e.to_string()))?;
        let _ = self
            .bus
            .publish(&rollback_topic, Payload::ConfigRollback(rollback_payload), PublishMetadata::default())
            .await;
        let _ = self
            .bus
            .publish(&rollback_topic, Payload::ConfigSnapshot(payload), PublishMetadata::default())
            .await;

        info!(from = prev_version, to = new_version, restored = version, "config rolled back");
        Ok(new_version)
    }

    async fn reject(&self, diagnostics: Vec<ConfigDiagnostic>) -> ApplyOutcome {
        warn!(?diagnostics, "config update rejected");
        let topic_result: Result<Topic, BusError> = "status.contract".try_into();
        if let Ok(topic) = topic_result {
            let _ = self
                .bus
                .publish(
                    &topic,
                    Payload::ConfigRejected(ConfigRejected {
                        diagnostics: diagnostics.clone(),
                    }),
                    PublishMetadata::default(),
                )
                .await;
        }
        ApplyOutcome::Rejected { diagnostics }
    }
}

fn snapshot_topic() -> Result<Topic, ConfigError> {
    "config.snapshot"
        .try_into()
        .map_err(|e: BusError| ConfigError::Invalid(e.to_string()))
}

struct ConfigUpdateHandler {
    service: Arc<ConfigService>,
}

#[async_trait]
impl Handler for ConfigUpdateHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Payload::ConfigUpdate(update) = &envelope.payload {
            self.service.apply_changes(vec![update.clone()]).await;
        }
        Ok(())
    }
}

fn merge_toml_file_into(tree: &mut Value, path: &std::path::Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let toml_value: toml::Value = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let json_value = serde_json::to_value(toml_value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    deep_merge(tree, json_value);
    Ok(())
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Object(overlay_map) => {
            if !base.is_object() {
                *base = Value::Object(serde_json::Map::new());
            }
            let base_map = base.as_object_mut().expect("just coerced to object");
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key).or_insert(Value::Null), value);
            }
        }
        other => *base = other,
    }
}

fn apply_env_overrides(tree: &mut Value) -> Result<(), ConfigError> {
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path = rest.to_lowercase().replace("__", ".");
        set_dotted(tree, &path, parse_env_value(&value))?;
    }
    Ok(())
}

fn parse_env_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;

    #[tokio::test]
    async fn load_from_empty_dir_publishes_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let topic: Topic = "config.snapshot".try_into().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        struct Capture(tokio::sync::mpsc::Sender<Arc<Envelope>>);
        #[async_trait]
        impl Handler for Capture {
            async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                let _ = self.0.send(envelope).await;
                Ok(())
            }
        }
        bus.subscribe_default(&topic, "test", Arc::new(Capture(tx))).await.unwrap();

        let service = ConfigService::load(bus, dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        assert_eq!(service.current_version(), 1);

        let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match &envelope.payload {
            Payload::ConfigSnapshot(p) => assert_eq!(p.version, 1),
            _ => panic!("expected ConfigSnapshot"),
        }
    }

    #[tokio::test]
    async fn apply_changes_empty_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let service = ConfigService::load(bus, dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        match service.apply_changes(vec![]).await {
            ApplyOutcome::NoOp { version } => assert_eq!(version, 1),
            other => panic!("expected NoOp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_changes_rejects_negative_window() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let service = ConfigService::load(bus, dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        let outcome = service
            .apply_changes(vec![ConfigUpdate {
                path: "dedupe.window_seconds".into(),
                value: serde_json::json!(-1),
                requester: "test".into(),
            }])
            .await;
        assert!(matches!(outcome, ApplyOutcome::Rejected { .. }));
        assert_eq!(service.current_version(), 1);
    }

    #[tokio::test]
    async fn apply_changes_commits_and_increments_version() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let service = ConfigService::load(bus, dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        let outcome = service
            .apply_changes(vec![ConfigUpdate {
                path: "dedupe.window_seconds".into(),
                value: serde_json::json!(0),
                requester: "test".into(),
            }])
            .await;
        assert!(matches!(outcome, ApplyOutcome::Committed { version: 2 }));
        assert_eq!(service.current_tree().dedupe.window_seconds, 0.0);
    }

    #[tokio::test]
    async fn rollback_restores_prior_tree_and_advances_version() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Bus::spawn();
        let service = ConfigService::load(bus, dir.path().join("config"), dir.path().join("secrets.toml"))
            .await
            .unwrap();
        service
            .apply_changes(vec![ConfigUpdate {
                path: "dedupe.window_seconds".into(),
                value: serde_json::json!(0),
                requester: "test".into(),
            }])
            .await;
        assert_eq!(service.current_tree().dedupe.window_seconds, 0.0);

        let new_version = service.rollback(1).await.unwrap();
        assert_eq!(new_version, 3);
        assert_eq!(service.current_tree().dedupe.window_seconds, 30.0);
    }
}
