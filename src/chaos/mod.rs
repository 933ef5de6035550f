//! Chaos interceptor (spec §4.7): injects latency and probabilistic drops
//! into a matching topic on command, for resilience drills.
//!
//! Grounded on `kimberlitedb-kimberlite`'s convention of a dedicated
//! chaos/fault-injection module kept separate from the core dispatch
//! path, and on the teacher's explicit-enum discipline for scenario
//! state (`FrameworkError`-style: named variants, not stringly-typed
//! flags).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

use crate::bus::{BusHandle, Handler, InterceptOutcome, Interceptor};
use crate::contracts::{Envelope, Payload, PublishMetadata, ResilienceAction, ResilienceEvent, Topic};

#[derive(Debug, Clone)]
struct Scenario {
    topic_glob: String,
    latency: Duration,
    drop_probability: f64,
}

impl Scenario {
    fn matches(&self, topic: &str) -> bool {
        match self.topic_glob.strip_suffix(".*") {
            Some(prefix) => topic == prefix || topic.starts_with(&format!("{prefix}.")),
            None => topic == self.topic_glob,
        }
    }
}

/// Installed once on the bus via `BusHandle::intercept`. Scenarios are
/// toggled by publishing a `ControlCommand{command: "resilience.toggle",
/// scenario_id, enabled, params}` on `dashboard.control.command`; this
/// struct also owns that subscription so toggle and intercept share one
/// `Arc<Mutex<...>>` without a second actor.
pub struct ChaosInterceptor {
    scenarios: Arc<Mutex<HashMap<String, Scenario>>>,
    bus: BusHandle,
}

impl ChaosInterceptor {
    /// Subscribes to `dashboard.control.command` and returns the
    /// interceptor, ready to be installed with `bus.intercept(...)`.
    pub async fn install(bus: BusHandle) -> Result<Arc<Self>, crate::error::BusError> {
        let scenarios = Arc::new(Mutex::new(HashMap::new()));
        let control_topic: Topic = "dashboard.control.command".try_into()?;
        let handler = Arc::new(ControlHandler {
            scenarios: scenarios.clone(),
            bus: bus.clone(),
        });
        bus.subscribe_default(&control_topic, "chaos", handler).await?;
        Ok(Arc::new(Self { scenarios, bus }))
    }
}

#[async_trait]
impl Interceptor for ChaosInterceptor {
    async fn intercept(&self, envelope: &mut Envelope) -> InterceptOutcome {
        let matched = {
            let scenarios = self.scenarios.lock();
            scenarios.values().find(|s| s.matches(&envelope.topic)).cloned()
        };
        let Some(scenario) = matched else {
            return InterceptOutcome::Continue;
        };

        if !scenario.latency.is_zero() {
            tokio::time::sleep(scenario.latency).await;
        }

        if scenario.drop_probability > 0.0 {
            let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);
            if roll < scenario.drop_probability {
                return InterceptOutcome::Drop;
            }
        }

        InterceptOutcome::Continue
    }

    fn name(&self) -> &str {
        "chaos"
    }
}

struct ControlHandler {
    scenarios: Arc<Mutex<HashMap<String, Scenario>>>,
    bus: BusHandle,
}

#[async_trait]
impl Handler for ControlHandler {
    async fn handle(&self, envelope: Arc<Envelope>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Payload::ControlCommand(command) = &envelope.payload else {
            return Ok(());
        };
        if command.command != "resilience.toggle" {
            return Ok(());
        }

        let scenario_id = command
            .arguments
            .get("scenario_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if scenario_id.is_empty() {
            warn!("resilience.toggle missing scenario_id");
            return Ok(());
        }
        let enabled = command.arguments.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false);
        let params = command.arguments.get("params").cloned().unwrap_or_default();
        let topic_glob = params.get("topic").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let latency_ms = params.get("latency_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        let drop_probability = params.get("drop_probability").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let action = if enabled {
            self.scenarios.lock().insert(
                scenario_id.clone(),
                Scenario {
                    topic_glob: topic_glob.clone(),
                    latency: Duration::from_millis(latency_ms),
                    drop_probability,
                },
            );
            info!(scenario_id, topic_glob, latency_ms, drop_probability, "resilience scenario enabled");
            ResilienceAction::Injected
        } else {
            self.scenarios.lock().remove(&scenario_id);
            info!(scenario_id, "resilience scenario cleared");
            ResilienceAction::Cleared
        };

        let event_topic: Topic = "status.resilience.event".try_into()?;
        self.bus
            .publish(
                &event_topic,
                Payload::ResilienceEvent(ResilienceEvent {
                    scenario_id,
                    action,
                    topic_glob,
                    parameters: command
                        .arguments
                        .get("params")
                        .and_then(|v| v.as_object())
                        .map(|m| m.clone().into_iter().collect())
                        .unwrap_or_default(),
                }),
                PublishMetadata::default(),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_glob_matches_only_that_topic() {
        let scenario = Scenario {
            topic_glob: "status.bus".into(),
            latency: Duration::ZERO,
            drop_probability: 0.0,
        };
        assert!(scenario.matches("status.bus"));
        assert!(!scenario.matches("status.health.summary"));
    }

    #[test]
    fn domain_glob_matches_any_topic_in_that_domain() {
        let scenario = Scenario {
            topic_glob: "status.*".into(),
            latency: Duration::ZERO,
            drop_probability: 0.0,
        };
        assert!(scenario.matches("status.bus"));
        assert!(scenario.matches("status.health.summary"));
        assert!(!scenario.matches("event.snapshot.ready"));
    }
}
