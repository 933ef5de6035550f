//! # surveillance-core
//!
//! The in-process event bus, module lifecycle orchestrator, and config
//! hot-reload service at the center of an event-driven surveillance
//! platform. Cameras, detectors, artifact builders, notifiers, storage
//! writers and dashboards all talk to each other only through the bus;
//! this crate never decodes a frame, runs inference, encodes media,
//! touches a filesystem/object store, or speaks an external protocol —
//! those belong to the modules that plug into it.
//!
//! ## Module tour
//!
//! - [`contracts`] — the wire vocabulary: `Topic`, `Envelope`, the
//!   `Payload` union, and the `Capability` descriptor every module
//!   publishes about itself.
//! - [`bus`] — the async publish/subscribe router: one task owns the
//!   subscription table, `BusHandle` is the cloneable client side.
//! - [`config`] — layered TOML + env config, versioned snapshots,
//!   fingerprinted rollback, secrets indirection.
//! - [`orchestrator`] — module registry and lifecycle driver: boot
//!   ordering, config-change diffing, health polling, staged shutdown,
//!   a periodic rollback drill.
//! - [`stages`] — the two built-in processing stages every deployment
//!   gets for free: dedupe and rate-limit.
//! - [`chaos`] — fault injection for resilience testing, wired in as a
//!   bus interceptor.
//! - [`shims`] — minimal real `Module` implementations for each external
//!   category (camera, processor, artifact builder, notifier, storage,
//!   dashboard), standing in for the real domain modules.
//! - [`error`] — the error taxonomy shared across all of the above.
//! - [`telemetry`] — structured logging init.

pub mod bus;
pub mod chaos;
pub mod config;
pub mod contracts;
pub mod error;
pub mod orchestrator;
pub mod shims;
pub mod stages;
pub mod telemetry;
