//! The typed configuration tree, its sanitized broadcast form, and the
//! dotted-path update mechanism (spec §4.3, §6).
//!
//! Grounded on `other_examples/…config-snapshot.rs`'s sanitized
//! `ConfigSnapshot`/`From<&FullConfig>` split: a typed internal tree,
//! converted to a plain, secret-free payload before it ever reaches the
//! bus. The difference here is the internal tree is never itself
//! secret-bearing — fragments carry `token_ref` indirection per spec §6,
//! so the broadcast conversion is a direct `serde_json` serialization
//! rather than a field-by-field masking pass.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::{ConfigDiagnostic, ConfigSnapshotPayload};
use crate::error::ConfigError;

/// One pluggable module's configuration fragment. `extra` carries every
/// field the built-in sections don't name explicitly — module schemas are
/// owned by the modules themselves, not by `ConfigTree` (spec §4.1:
/// "Each fragment is validated by that module's config schema").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModuleFragment {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub token_ref: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub environment: String,
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            log_level: "info".into(),
        }
    }
}

/// Built-in dedupe stage config (spec §4.5). A dedicated top-level section
/// rather than a `process` fragment: it is a core-provided building block,
/// not a pluggable external module, so the dotted path the testable
/// scenarios use (`dedupe.window_seconds`) addresses it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    pub window_seconds: f64,
    #[serde(default = "default_dedupe_keys")]
    pub key_attributes: Vec<String>,
    #[serde(default = "default_lru_capacity")]
    pub lru_capacity: usize,
    #[serde(default = "default_dedupe_topic")]
    pub source_topic: String,
}

fn default_dedupe_keys() -> Vec<String> {
    vec!["camera_id".into(), "kind".into(), "label".into()]
}
fn default_lru_capacity() -> usize {
    4096
}
fn default_dedupe_topic() -> String {
    "process.motion.detected".into()
}

/// Built-in rate-limit stage config (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
    #[serde(default = "default_rate_limit_key")]
    pub key_attribute: String,
    #[serde(default = "default_idle_eviction_seconds")]
    pub idle_eviction_seconds: u64,
    #[serde(default = "default_rate_limit_topic")]
    pub source_topic: String,
}

fn default_rate_limit_key() -> String {
    "camera_id".into()
}
fn default_idle_eviction_seconds() -> u64 {
    300
}
fn default_rate_limit_topic() -> String {
    "event.snapshot.ready".into()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 4.0,
            refill_per_second: 1.0,
            key_attribute: default_rate_limit_key(),
            idle_eviction_seconds: default_idle_eviction_seconds(),
            source_topic: default_rate_limit_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusConfig {
    pub bus_sample_interval_seconds: Option<u64>,
    pub health_summary_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub scenarios: HashMap<String, Value>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scenarios: HashMap::new(),
        }
    }
}

/// The typed, normalized configuration tree (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigTree {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub cameras: Vec<ModuleFragment>,
    #[serde(default)]
    pub process: Vec<ModuleFragment>,
    #[serde(default)]
    pub event: Vec<ModuleFragment>,
    #[serde(default)]
    pub outputs: Vec<ModuleFragment>,
    #[serde(default)]
    pub storage: Vec<ModuleFragment>,
    #[serde(default)]
    pub analytics: Vec<ModuleFragment>,
    #[serde(default)]
    pub dashboards: Vec<ModuleFragment>,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            window_seconds: 30.0,
            key_attributes: default_dedupe_keys(),
            lru_capacity: default_lru_capacity(),
            source_topic: default_dedupe_topic(),
        }
    }
}

impl ConfigTree {
    /// All fragment arrays, for id-uniqueness and reference validation.
    fn fragment_sections(&self) -> [(&'static str, &Vec<ModuleFragment>); 7] {
        [
            ("cameras", &self.cameras),
            ("process", &self.process),
            ("event", &self.event),
            ("outputs", &self.outputs),
            ("storage", &self.storage),
            ("analytics", &self.analytics),
            ("dashboards", &self.dashboards),
        ]
    }

    /// Every module fragment across every section, flattened — used for
    /// secret-reference resolution at load time.
    pub fn all_fragments(&self) -> impl Iterator<Item = &ModuleFragment> + '_ {
        self.fragment_sections().into_iter().flat_map(|(_, frags)| frags.iter())
    }

    /// Structural + range validation (spec §4.3: "runs the full validator").
    /// Per-module schema detail is the owning module's responsibility; this
    /// checks what the core itself depends on holding true.
    pub fn validate(&self) -> Vec<ConfigDiagnostic> {
        let mut diagnostics = Vec::new();

        if self.dedupe.window_seconds < 0.0 {
            diagnostics.push(ConfigDiagnostic {
                field: "dedupe.window_seconds".into(),
                reason: "must be >= 0".into(),
            });
        }
        if self.dedupe.lru_capacity == 0 {
            diagnostics.push(ConfigDiagnostic {
                field: "dedupe.lru_capacity".into(),
                reason: "must be > 0".into(),
            });
        }
        if self.rate_limit.capacity < 0.0 {
            diagnostics.push(ConfigDiagnostic {
                field: "rate_limit.capacity".into(),
                reason: "must be >= 0".into(),
            });
        }
        if self.rate_limit.refill_per_second < 0.0 {
            diagnostics.push(ConfigDiagnostic {
                field: "rate_limit.refill_per_second".into(),
                reason: "must be >= 0".into(),
            });
        }

        let mut seen_ids: HashMap<&str, &str> = HashMap::new();
        for (section, fragments) in self.fragment_sections() {
            for fragment in fragments {
                if fragment.id.is_empty() {
                    diagnostics.push(ConfigDiagnostic {
                        field: format!("{section}[]"),
                        reason: "fragment is missing a stable id".into(),
                    });
                    continue;
                }
                if fragment.type_name.is_empty() {
                    diagnostics.push(ConfigDiagnostic {
                        field: format!("{section}.{}", fragment.id),
                        reason: "fragment is missing a type".into(),
                    });
                }
                if let Some(owner) = seen_ids.insert(&fragment.id, section) {
                    diagnostics.push(ConfigDiagnostic {
                        field: format!("{section}.{}", fragment.id),
                        reason: format!("duplicate module id, already used in {owner}"),
                    });
                }
            }
        }

        diagnostics
    }

    /// Builds the sanitized payload broadcast on `config.snapshot`. Secrets
    /// never reach this value because `ModuleFragment` only ever stores
    /// `token_ref` indirection, never a resolved secret.
    pub fn to_snapshot_payload(&self, version: u64) -> Result<ConfigSnapshotPayload, ConfigError> {
        let tree = serde_json::to_value(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(ConfigSnapshotPayload { version, tree })
    }

    pub fn sampled_at(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Applies one dotted-path `field = value` update to a JSON tree in place.
/// Intermediate object segments are created as empty objects if absent;
/// array segments (e.g. inside `cameras`) are not addressable by this
/// mechanism — fragment arrays are updated wholesale via their section key.
pub fn set_dotted(tree: &mut Value, path: &str, value: Value) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::Invalid("empty update path".into()));
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut cursor = tree;
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        let map = cursor.as_object_mut().expect("just coerced to object");
        if is_last {
            map.insert((*segment).to_string(), value);
            return Ok(());
        }
        cursor = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tree_validates_clean() {
        assert!(ConfigTree::default().validate().is_empty());
    }

    #[test]
    fn negative_dedupe_window_is_rejected() {
        let mut tree = ConfigTree::default();
        tree.dedupe.window_seconds = -1.0;
        let diagnostics = tree.validate();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].field, "dedupe.window_seconds");
    }

    #[test]
    fn duplicate_module_ids_across_sections_are_rejected() {
        let mut tree = ConfigTree::default();
        tree.cameras.push(ModuleFragment {
            id: "front-door".into(),
            type_name: "rtsp".into(),
            ..Default::default()
        });
        tree.process.push(ModuleFragment {
            id: "front-door".into(),
            type_name: "motion".into(),
            ..Default::default()
        });
        assert_eq!(tree.validate().len(), 1);
    }

    #[test]
    fn set_dotted_creates_intermediate_objects() {
        let mut tree = serde_json::json!({});
        set_dotted(&mut tree, "dedupe.window_seconds", serde_json::json!(0)).unwrap();
        assert_eq!(tree["dedupe"]["window_seconds"], serde_json::json!(0));
    }
}
