//! Staggered shard launcher
//!
//! Shards are constructed one at a time, in increasing id order, with
//! [`LAUNCH_INTERVAL`] between attempts. Serializing construction through a
//! single task is what keeps the fleet inside the remote identify rate limit.
//!
//! The first shard of the range is built on the caller's task so credential
//! and argument errors reach the caller directly. Everything after it runs on
//! one background task owned by the fleet.
//!
//! Per shard id: `PENDING → ATTEMPTING → LAUNCHED | RATE_LIMITED | FAILED`.
//! A rate-limited id is retried indefinitely. A failed id is retried up to
//! [`MAX_LAUNCH_ATTEMPTS`] times before the launch is aborted. Invalid
//! credentials abort at once.
//!
//! There is no timeout on a single construction call: a factory that hangs
//! holds up every shard after it until the fleet is shut down.

use crate::error::{FleetError, LaunchError};
use crate::gateway::{ClientFactory, ShardId, ShardInfo};
use crate::shard::manager::{FleetInner, LaunchState};
use crate::telemetry;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Minimum delay between two shard construction attempts
pub const LAUNCH_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive non-rate-limit failures tolerated for one shard id
pub const MAX_LAUNCH_ATTEMPTS: u32 = 3;

/// Result of one construction attempt
#[derive(Debug)]
enum Attempt {
    Launched,
    /// Fleet shut down while the shard was being built
    Discarded,
    Failed(LaunchError),
}

async fn attempt<F: ClientFactory>(inner: &FleetInner<F>, shard_id: ShardId) -> Attempt {
    let config = inner.shard_config(shard_id);
    let shard = ShardInfo {
        id: shard_id,
        total: inner.range.total(),
    };

    telemetry::record_launch_attempt(shard_id);
    debug!(shard_id, total = shard.total, "Constructing shard");

    match inner.factory.create(shard, &config).await {
        Ok(client) => {
            if inner.register(shard_id, client, &config.presence) {
                info!(shard_id, total = shard.total, "Shard launched");
                Attempt::Launched
            } else {
                debug!(shard_id, "Shard discarded after shutdown");
                Attempt::Discarded
            }
        }
        Err(e) => {
            telemetry::record_error(shard_id, e.error_type_label());
            if e.is_rate_limited() {
                telemetry::record_rate_limited(shard_id);
            }
            Attempt::Failed(e)
        }
    }
}

/// Delay before the next attempt after a rate limit rejection
fn retry_delay(retry_after: Option<Duration>) -> Duration {
    retry_after.map_or(LAUNCH_INTERVAL, |after| after.max(LAUNCH_INTERVAL))
}

/// Build the first shard of the range on the caller's task and hand the
/// rest of the range to a background task.
///
/// Returns the caller-facing error if the first shard fails for any reason
/// other than the rate limit; nothing has been constructed in that case.
pub(super) async fn start<F: ClientFactory>(
    inner: &Arc<FleetInner<F>>,
) -> Result<(), FleetError> {
    let first = inner.range.lower();

    info!(
        lower = inner.range.lower(),
        upper = inner.range.upper(),
        total = inner.range.total(),
        "Launching shard fleet"
    );

    let delay = match attempt(&**inner, first).await {
        Attempt::Launched | Attempt::Discarded => LAUNCH_INTERVAL,
        Attempt::Failed(LaunchError::RateLimited { retry_after }) => {
            warn!(shard_id = first, ?retry_after, "First shard rate limited, retrying in background");
            retry_delay(retry_after)
        }
        Attempt::Failed(e) => {
            error!(shard_id = first, error = %e, "First shard failed to launch");
            return Err(e.into_fleet_error(first));
        }
    };

    if inner.cursor.load(Ordering::SeqCst) > inner.range.upper() {
        inner.set_state(LaunchState::Complete);
        info!(launched = inner.shards.len(), "All shards launched");
        return Ok(());
    }

    let handle = tokio::spawn(run(Arc::clone(inner), delay));
    *inner.launcher.lock() = Some(handle);
    Ok(())
}

/// Sleep for `delay` unless the fleet shuts down first. Returns false on shutdown.
async fn pause<F: ClientFactory>(inner: &FleetInner<F>, delay: Duration) -> bool {
    if inner.is_shut_down() {
        return false;
    }
    tokio::select! {
        _ = inner.cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => !inner.is_shut_down(),
    }
}

/// Background launch loop for the tail of the range
async fn run<F: ClientFactory>(inner: Arc<FleetInner<F>>, mut delay: Duration) {
    let upper = inner.range.upper();
    let mut failures: u32 = 0;

    loop {
        if !pause(&*inner, delay).await {
            debug!("Launcher stopped by shutdown");
            return;
        }

        let shard_id = inner.cursor.load(Ordering::SeqCst);
        if shard_id > upper {
            break;
        }

        delay = LAUNCH_INTERVAL;
        match attempt(&*inner, shard_id).await {
            Attempt::Launched => failures = 0,
            Attempt::Discarded => return,
            Attempt::Failed(LaunchError::RateLimited { retry_after }) => {
                delay = retry_delay(retry_after);
                warn!(shard_id, ?delay, "Shard rate limited, retrying");
            }
            Attempt::Failed(LaunchError::InvalidCredentials) => {
                error!(shard_id, "Credentials rejected, aborting launch");
                inner.abort(shard_id, LaunchError::InvalidCredentials.to_string());
                return;
            }
            Attempt::Failed(e) => {
                failures += 1;
                if failures >= MAX_LAUNCH_ATTEMPTS {
                    error!(
                        shard_id,
                        error = %e,
                        attempts = failures,
                        "Shard failed to launch, aborting remaining launches"
                    );
                    inner.abort(shard_id, e.to_string());
                    return;
                }
                warn!(
                    shard_id,
                    error = %e,
                    attempt = failures,
                    max = MAX_LAUNCH_ATTEMPTS,
                    "Shard failed to launch, retrying"
                );
            }
        }

        if inner.cursor.load(Ordering::SeqCst) > upper {
            break;
        }
    }

    inner.set_state(LaunchState::Complete);
    info!(launched = inner.shards.len(), "All shards launched");
}
