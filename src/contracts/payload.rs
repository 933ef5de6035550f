//! Canonical payload schemas (spec §3 table) and the tolerant-parsing rule
//! from §4.1: unknown fields are ignored whenever `schema_version` is
//! greater than the version a given build knows about.
//!
//! Grounded on the teacher's DTO discipline in `model/mod.rs` (plain,
//! serializable structs with no framework dependency) and on
//! `other_examples/…config-snapshot.rs`'s use of loosely typed
//! `serde_json::Value` maps for free-form metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The current schema version this build understands for each payload kind.
/// A payload carrying a higher version is still accepted (unknown fields are
/// dropped by serde's default struct deserialization) but is not validated
/// beyond structural shape.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    Inline(Vec<u8>),
    Handle(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub data: FrameData,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    Motion,
    Object,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DetectionKind,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Snapshot,
    Gif,
    Clip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub kind: ArtifactKind,
    pub path_or_handle: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub channel: String,
    pub caption: String,
    pub artifact_ref: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub command: String,
    pub target_module: Option<String>,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub path: String,
    pub value: Value,
    pub requester: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshotPayload {
    pub version: u64,
    pub tree: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRollbackPayload {
    pub previous_version: u64,
    pub current_version: u64,
    pub diagnostics: String,
    /// Present when the rollback was scoped to a single module (orchestrator
    /// reconfigure-failure path) rather than a whole-tree config rollback.
    #[serde(default)]
    pub module_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRejected {
    pub diagnostics: Vec<ConfigDiagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDiagnostic {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Stopped,
    Error,
    Degraded,
    Starting,
    Healthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub module_id: String,
    pub state: ModuleState,
    #[serde(default)]
    pub detail: HashMap<String, Value>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub overall: ModuleState,
    pub modules: HashMap<String, HealthStatus>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub subscriber_id: String,
    pub topic: String,
    pub depth: usize,
    pub capacity: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub oldest_enqueued_age_ms: Option<i64>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatus {
    pub published_total: u64,
    pub subscriptions: Vec<SubscriptionStatus>,
    pub sampled_at: DateTime<Utc>,
}

/// Per-key drop counters for the rate-limit stage (spec §4.6: "a per-key
/// drop counter reported on `status.rate_limit`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub dropped_by_key: HashMap<String, u64>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownProgress {
    pub phase: String,
    pub modules_remaining: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceAction {
    Injected,
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceEvent {
    pub scenario_id: String,
    pub action: ResilienceAction,
    pub topic_glob: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

/// The union of every payload kind the bus can carry.
///
/// A tagged enum (rather than `Box<dyn Any>`) so the bus never needs
/// downcasting: matching on `Payload` is exhaustive and compiler-checked,
/// continuing the teacher's preference for compile-time guarantees over
/// runtime type inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Payload {
    Frame(Frame),
    DetectionEvent(DetectionEvent),
    MediaArtifact(MediaArtifact),
    AlertNotification(AlertNotification),
    ControlCommand(ControlCommand),
    ConfigUpdate(ConfigUpdate),
    ConfigSnapshot(ConfigSnapshotPayload),
    ConfigRollback(ConfigRollbackPayload),
    ConfigRejected(ConfigRejected),
    HealthStatus(HealthStatus),
    HealthSummary(HealthSummary),
    BusStatus(BusStatus),
    RateLimitStatus(RateLimitStatus),
    ShutdownProgress(ShutdownProgress),
    ResilienceEvent(ResilienceEvent),
}

impl Payload {
    pub fn schema_version(&self) -> u32 {
        CURRENT_SCHEMA_VERSION
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Frame(_) => "Frame",
            Payload::DetectionEvent(_) => "DetectionEvent",
            Payload::MediaArtifact(_) => "MediaArtifact",
            Payload::AlertNotification(_) => "AlertNotification",
            Payload::ControlCommand(_) => "ControlCommand",
            Payload::ConfigUpdate(_) => "ConfigUpdate",
            Payload::ConfigSnapshot(_) => "ConfigSnapshotPayload",
            Payload::ConfigRollback(_) => "ConfigRollbackPayload",
            Payload::ConfigRejected(_) => "ConfigRejected",
            Payload::HealthStatus(_) => "HealthStatus",
            Payload::HealthSummary(_) => "HealthSummary",
            Payload::BusStatus(_) => "BusStatus",
            Payload::RateLimitStatus(_) => "RateLimitStatus",
            Payload::ShutdownProgress(_) => "ShutdownProgress",
            Payload::ResilienceEvent(_) => "ResilienceEvent",
        }
    }
}
