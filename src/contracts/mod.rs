//! # Contracts
//!
//! The contract surface (spec §4.1): topic naming rules, the envelope, the
//! canonical payload schemas, and the module capability descriptor. This
//! module has no runtime dependencies on the bus, config service, or
//! orchestrator — everything downstream depends on it, never the reverse,
//! the same leaf-first layering the teacher's `model/` module occupies
//! relative to `framework/` and `clients/`.

pub mod capability;
pub mod envelope;
pub mod payload;
pub mod topic;

pub use capability::{Capability, ModuleCategory};
pub use envelope::{Envelope, PublishMetadata, SequenceGenerator};
pub use payload::*;
pub use topic::{Topic, RESERVED_DOMAINS};
