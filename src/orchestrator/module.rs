//! The `Module` trait and the orchestrator's bookkeeping record for one
//! registered module (spec §4.4).
//!
//! Grounded on the teacher's `ActorEntity` trait: associated lifecycle
//! hooks driven by a generic runner, a per-hook deadline instead of
//! unbounded awaits, and one error enum for the whole trait rather than
//! per-method error types. The generalization is from "entity CRUD hooks"
//! to "module lifecycle hooks" (`configure`/`start`/`stop`/`health`), and
//! from a `Context` injected once at actor-spawn time to a `BusHandle`
//! injected at `start` time, per spec §9's "late binding" design note.

use async_trait::async_trait;
use serde_json::Value;

use crate::bus::BusHandle;
use crate::contracts::{Capability, HealthStatus, ModuleCategory};
use crate::error::ModuleError;

/// A long-lived unit of the pipeline: a camera input, a detector, an
/// artifact builder, a notifier, a storage sink, a dashboard, or one of
/// the core-provided stages (dedupe, rate-limit, chaos).
#[async_trait]
pub trait Module: Send + Sync {
    /// The module's static capability descriptor.
    fn capability(&self) -> &Capability;

    /// Applies (or re-applies) this module's configuration fragment.
    /// Idempotent: calling twice with the same fragment must not change
    /// observable state (spec §8 round-trip law).
    async fn configure(&self, fragment: Value) -> Result<(), ModuleError>;

    /// Subscribes to the bus and begins producing. Called once per
    /// `configure`→`start` transition; never called while already running.
    async fn start(&self, bus: BusHandle) -> Result<(), ModuleError>;

    /// Unsubscribes and releases resources. Called exactly once in the
    /// module's lifetime (spec §3: "is stopped exactly once").
    async fn stop(&self) -> Result<(), ModuleError>;

    /// A point-in-time health read, polled by the orchestrator's health
    /// loop (spec §4.4). Must not block indefinitely; the orchestrator
    /// applies its own deadline around the call.
    async fn health(&self) -> HealthStatus;
}

/// Where a module sits in the `created → configured → running → stopped`
/// machine (spec §4.4 diagram). Distinct from `ModuleState`, which is the
/// *health* ordering reported externally — a module can be `Running` and
/// simultaneously `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Created,
    Configured,
    Running,
    Stopped,
    /// Abandoned by the orchestrator without confirmation that `stop()`
    /// ran to completion — e.g. it missed its shutdown deadline (spec
    /// §4.4, §7 `ShutdownDeadlineExceeded`).
    Error,
}

/// Orchestrator-owned bookkeeping for one registered module. The module
/// itself owns its own runtime state (spec §5 "Shared-resource policy");
/// this record only tracks what the orchestrator needs to drive the
/// lifecycle and reconfiguration protocol.
pub struct ModuleRecord {
    pub module: std::sync::Arc<dyn Module>,
    pub phase: LifecyclePhase,
    pub category: ModuleCategory,
    pub restart_on_configure_failure: bool,
    /// The last fragment value successfully applied, used to diff
    /// incoming snapshots (spec §4.4 "computes a per-module diff").
    pub fragment: Value,
    pub last_health: Option<HealthStatus>,
}
