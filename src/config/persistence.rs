//! Bounded snapshot history persisted to `snapshots.json` (spec §6:
//! "Entries are `{version, fingerprint, payload, timestamp}`").
//!
//! Grounded on `CambrianTech-continuum`'s use of `sha2` for content
//! fingerprinting, applied here to the normalized JSON bytes of each
//! committed snapshot so the rollback drill (§4.4) can compare
//! before/after fingerprints without re-diffing the whole tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// How many snapshot versions are retained on disk (spec §6).
pub const MAX_HISTORY: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub version: u64,
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Computes a stable fingerprint over a snapshot's JSON tree.
///
/// `serde_json::Value` objects without the `preserve_order` feature are
/// backed by a `BTreeMap`, so `to_vec` already yields key-sorted, stable
/// bytes — no separate canonicalization pass is needed.
pub fn fingerprint(tree: &serde_json::Value) -> Result<String, ConfigError> {
    let bytes = serde_json::to_vec(tree).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{digest:x}"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    entries: Vec<SnapshotEntry>,
}

pub struct SnapshotHistory {
    path: PathBuf,
    entries: Vec<SnapshotEntry>,
}

impl SnapshotHistory {
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = config_dir.as_ref().join("snapshots.json");
        if !path.exists() {
            return Ok(Self {
                path,
                entries: Vec::new(),
            });
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let file: HistoryFile = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self {
            path,
            entries: file.entries,
        })
    }

    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.entries.last()
    }

    pub fn get(&self, version: u64) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.version == version)
    }

    /// Appends a committed snapshot and truncates to `MAX_HISTORY`,
    /// dropping the oldest entries first.
    pub fn push(&mut self, entry: SnapshotEntry) -> Result<(), ConfigError> {
        self.entries.push(entry);
        if self.entries.len() > MAX_HISTORY {
            let overflow = self.entries.len() - MAX_HISTORY;
            self.entries.drain(0..overflow);
        }
        self.persist()
    }

    fn persist(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let file = HistoryFile {
            entries: self.entries.clone(),
        };
        let raw = serde_json::to_string_pretty(&file).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn history_truncates_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = SnapshotHistory::load(dir.path()).unwrap();
        for v in 1..=10u64 {
            history
                .push(SnapshotEntry {
                    version: v,
                    fingerprint: format!("fp{v}"),
                    payload: serde_json::json!({"version": v}),
                    timestamp: Utc::now(),
                })
                .unwrap();
        }
        assert_eq!(history.entries.len(), MAX_HISTORY);
        assert_eq!(history.entries.first().unwrap().version, 3);
        assert_eq!(history.entries.last().unwrap().version, 10);
    }
}
