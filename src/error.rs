//! Error taxonomy for the core (spec §7).
//!
//! Each component owns one `thiserror` enum, mirroring the teacher
//! framework's `FrameworkError`/`OrderError` split: a low-level
//! framework-style error (here, `BusError`) and higher-level component
//! errors that convert from it with `#[from]`.

use thiserror::Error;

/// Errors raised by the bus (`publish`/`subscribe`/`unsubscribe`/`intercept`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("publish to {topic} timed out waiting for queue space")]
    PublishTimeout { topic: String },

    #[error("publish to {topic} was cancelled")]
    PublishCancelled { topic: String },

    #[error("no such subscription")]
    UnknownSubscription,

    #[error("topic name invalid: {0}")]
    InvalidTopic(String),

    #[error("subscription capacity {0} exceeds the maximum of {1}")]
    CapacityExceeded(usize, usize),
}

/// Errors raised by `ConfigService`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config validation failed: {0}")]
    Invalid(String),

    #[error("required secret missing: {0}")]
    MissingSecret(String),

    #[error("secrets file has insecure permissions (expected 0600): {0}")]
    InsecureSecretsFile(String),

    #[error("no such config version: {0}")]
    UnknownVersion(u64),

    #[error("failed to read config document: {0}")]
    Io(String),

    #[error("failed to parse config document: {0}")]
    Parse(String),
}

/// Errors raised by module lifecycle calls (`configure`/`start`/`stop`/`health`).
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {0} failed to configure: {1}")]
    ConfigureFailed(String, String),

    #[error("module {0} failed to start: {1}")]
    StartFailed(String, String),

    #[error("module {0} failed to stop within the deadline")]
    StopDeadlineExceeded(String),

    #[error("module {0} health check failed: {1}")]
    HealthCheckFailed(String, String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Top-level orchestrator errors, surfaced on fatal boot failure (spec §6 exit codes).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration invalid: {0}")]
    Config(#[from] ConfigError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("bus initialization failed: {0}")]
    BusInit(String),

    #[error("unknown module factory for type {0}")]
    UnknownFactory(String),

    #[error("duplicate module id: {0}")]
    DuplicateModuleId(String),
}
