//! Interceptor pipeline (spec §4.2): installed in order, sees every
//! publication, may delay, drop, mutate, or pass through.
//!
//! Async-trait object, grounded on the teacher's lifecycle-hook pattern
//! (`ActorEntity::on_create`/`on_update`) of a trait method invoked by the
//! framework with a default no-op available for the common "pass through"
//! case.

use async_trait::async_trait;

use crate::contracts::Envelope;

/// What an interceptor decided for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    Continue,
    Drop,
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Inspect (and optionally mutate) the envelope before it is fanned out
    /// to subscriptions. Returning `Drop` stops the chain and the message is
    /// never delivered. Interceptor panics/errors are caught by the bus and
    /// treated as pass-through (spec §4.2 failure semantics) — this trait
    /// has no `Result` in its signature specifically so that "errors become
    /// pass-through" is enforced at the type level: an interceptor cannot
    /// fail the publish, only choose to drop.
    async fn intercept(&self, envelope: &mut Envelope) -> InterceptOutcome;

    /// Human-readable name, used in logging.
    fn name(&self) -> &str {
        "interceptor"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorHandle(pub(crate) u64);
