//! External module shims (spec §4.8): minimal but real `Module`
//! implementations for each category of domain collaborator the core
//! talks to over the bus. None of these interpret frame bytes, run
//! model inference, encode media, or speak an external wire protocol —
//! that stays with the real modules these stand in for. They exist so
//! the orchestrator's full lifecycle (boot, reconfigure, health,
//! shutdown) can be exercised end-to-end without those dependencies.
//!
//! Grounded on the teacher's `user_actor`/`product_actor`/`order_actor`
//! layout: one module per domain concept, each a thin wrapper that talks
//! to a shared dispatcher (there, `ResourceActor`; here, the bus)
//! instead of holding its own store.

pub mod artifact;
pub mod camera;
pub mod dashboard;
pub mod notifier;
pub mod processor;
pub mod storage;

pub use artifact::ArtifactShim;
pub use camera::CameraShim;
pub use dashboard::DashboardShim;
pub use notifier::NotifierShim;
pub use processor::ProcessorShim;
pub use storage::StorageShim;

use serde_json::Value;

pub(crate) fn field_str(fragment: &Value, key: &str, default: &str) -> String {
    fragment
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

pub(crate) fn field_u64(fragment: &Value, key: &str, default: u64) -> u64 {
    fragment.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}
