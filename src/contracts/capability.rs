//! Static capability descriptor (spec §4.1): "Every module advertises a
//! static capability descriptor: id, category, the topics it publishes,
//! the topics it subscribes to, the configuration fragment path it owns."

use super::topic::Topic;

/// The category a module belongs to, used both for the staged-shutdown
/// ordering (spec §4.4) and for boot-time validation that a module's
/// declared topics only touch reserved domains appropriate to its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleCategory {
    Input,
    Processor,
    EventBuilder,
    Output,
    Storage,
    Dashboard,
    Core,
}

impl ModuleCategory {
    /// Staged shutdown order (spec §4.4): inputs, processors, event
    /// builders, outputs and storage, dashboards, core services.
    pub fn shutdown_rank(self) -> u8 {
        match self {
            ModuleCategory::Input => 0,
            ModuleCategory::Processor => 1,
            ModuleCategory::EventBuilder => 2,
            ModuleCategory::Output => 3,
            ModuleCategory::Storage => 3,
            ModuleCategory::Dashboard => 4,
            ModuleCategory::Core => 5,
        }
    }

    pub fn phase_name(self) -> &'static str {
        match self {
            ModuleCategory::Input => "input",
            ModuleCategory::Processor => "process",
            ModuleCategory::EventBuilder => "event",
            ModuleCategory::Output => "output",
            ModuleCategory::Storage => "storage",
            ModuleCategory::Dashboard => "dashboard",
            ModuleCategory::Core => "core",
        }
    }
}

/// The static, compile-time-populated descriptor every module implementation
/// returns from `Module::capability()`.
#[derive(Debug, Clone)]
pub struct Capability {
    pub id: String,
    pub category: ModuleCategory,
    pub publishes: Vec<Topic>,
    pub subscribes: Vec<Topic>,
    /// Dotted path into the configuration tree this module owns, e.g.
    /// `process.motion_dedupe`.
    pub config_fragment_path: String,
    /// Whether a failed `configure` call should trigger the
    /// stop→configure→start restart sequence (spec §4.4).
    pub restart_on_configure_failure: bool,
}

impl Capability {
    /// Boot-time structural check: every published/subscribed topic's
    /// domain must be one of the reserved domains (spec §3). Exact-topic
    /// matching means this doesn't check routing correctness, only that
    /// the module isn't claiming to speak on a made-up domain.
    pub fn validate_domains(&self) -> Result<(), String> {
        for topic in self.publishes.iter().chain(self.subscribes.iter()) {
            if !super::topic::RESERVED_DOMAINS.contains(&topic.domain()) {
                return Err(format!(
                    "module {} references unreserved domain {:?} via topic {}",
                    self.id,
                    topic.domain(),
                    topic
                ));
            }
        }
        Ok(())
    }
}
