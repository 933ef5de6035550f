//! Core-provided pipeline stages: dedupe (§4.5) and rate-limit (§4.6).
//!
//! Both are `Module` implementations wrapping a `BusHandle`, grounded on
//! the teacher's `ActorClient` pattern of a thin client type holding a
//! handle to the actor it talks to — here the "actor" is the bus itself
//! rather than a `ResourceActor<T>`.

pub mod dedupe;
pub mod rate_limit;

pub use dedupe::DedupeModule;
pub use rate_limit::RateLimitModule;

use serde_json::Value;

/// Reads a string-keyed attribute off a JSON value the way both stages
/// need to: struct fields serialize as JSON scalars, free-form
/// `attributes`/`metadata` maps serialize as nested objects.
pub(crate) fn value_as_key_fragment(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
