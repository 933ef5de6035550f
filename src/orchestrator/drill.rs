//! Rollback drill scheduler: periodically proves the config round-trip
//! law holds (spec §8: "applying an empty update batch leaves the
//! snapshot version and fingerprint unchanged") by running a no-op
//! `apply_changes` cycle and comparing fingerprints before and after.
//!
//! Grounded on `bus/status.rs`'s telemetry sampler shape: a single
//! `tokio::time::interval` tick driving one cheap periodic check,
//! published as a `ConfigRollbackPayload` with `previous_version ==
//! current_version` so a clean drill reads as a no-op rollback event
//! rather than inventing a dedicated payload kind.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::BusHandle;
use crate::config::{ApplyOutcome, ConfigService};
use crate::contracts::{ConfigRollbackPayload, Payload, PublishMetadata, Topic};

/// Disabled by default; production deployments opt in via `main.rs`
/// wiring a real interval (the spec calls this "weekly" in passing but
/// does not pin an exact cadence, so the interval is a boot-time choice
/// rather than a config field).
pub const DEFAULT_DRILL_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Spawns the drill loop. Every tick: capture the current fingerprint,
/// run an empty `apply_changes` batch, capture the fingerprint again, and
/// publish a `ConfigRollbackPayload` whose `diagnostics` records pass/fail.
/// A real rollback never happens here — the drill only proves the round
/// trip is safe, it never actually discards committed state.
pub fn spawn_drill_loop(config: Arc<ConfigService>, bus: BusHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let topic: Topic = "config.snapshot".try_into().expect("config.snapshot is a reserved topic");
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it at startup

        loop {
            ticker.tick().await;
            let before = match config.current_fingerprint() {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(error = %e, "rollback drill: failed to fingerprint current config");
                    continue;
                }
            };
            let version_before = config.current_version();

            let outcome = config.apply_changes(vec![]).await;
            let stayed_noop = matches!(outcome, ApplyOutcome::NoOp { version } if version == version_before);

            let after = match config.current_fingerprint() {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(error = %e, "rollback drill: failed to fingerprint config after drill cycle");
                    continue;
                }
            };

            let diagnostics = if stayed_noop && before == after {
                info!(version = version_before, "rollback drill passed");
                format!("rollback drill passed: fingerprint {before} stable across no-op apply_changes")
            } else {
                warn!(version = version_before, "rollback drill FAILED: round-trip law violated");
                format!(
                    "rollback drill FAILED: fingerprint before={before} after={after}, outcome={outcome:?}"
                )
            };

            let _ = bus
                .publish(
                    &topic,
                    Payload::ConfigRollback(ConfigRollbackPayload {
                        previous_version: version_before,
                        current_version: config.current_version(),
                        diagnostics,
                        module_id: None,
                    }),
                    PublishMetadata::default(),
                )
                .await;
        }
    })
}
