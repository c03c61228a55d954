//! Prometheus metrics for the shard fleet
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed. The binary installs the Prometheus recorder via
//! [`FleetMetrics::install`] and renders it on `/metrics`.

use crate::error::FleetError;
use crate::gateway::ShardId;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus recorder handle
#[derive(Clone)]
pub struct FleetMetrics {
    handle: Arc<PrometheusHandle>,
}

impl FleetMetrics {
    /// Install the global Prometheus recorder and register descriptions
    pub fn install() -> Result<Self, FleetError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| FleetError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Register metric descriptions
fn register_metrics() {
    describe_counter!(
        "fleet_launch_attempts_total",
        Unit::Count,
        "Shard construction attempts"
    );
    describe_counter!(
        "fleet_shards_launched_total",
        Unit::Count,
        "Shards successfully constructed"
    );
    describe_counter!(
        "fleet_rate_limited_total",
        Unit::Count,
        "Shard constructions rejected by the identify rate limit"
    );
    describe_counter!(
        "fleet_errors_total",
        Unit::Count,
        "Fleet errors by type"
    );

    describe_gauge!(
        "fleet_shards_launched",
        Unit::Count,
        "Shards currently held by the fleet"
    );
    describe_gauge!(
        "fleet_shards_ready",
        Unit::Count,
        "Number of shards in ready state"
    );
    describe_gauge!(
        "fleet_average_ping_seconds",
        Unit::Seconds,
        "Mean heartbeat latency across launched shards"
    );
}

/// Record a construction attempt
pub fn record_launch_attempt(shard_id: ShardId) {
    counter!(
        "fleet_launch_attempts_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Record a successful construction
pub fn record_launched(shard_id: ShardId, launched: usize) {
    counter!(
        "fleet_shards_launched_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
    gauge!("fleet_shards_launched").set(launched as f64);
}

/// Record an identify rate limit rejection
pub fn record_rate_limited(shard_id: ShardId) {
    counter!(
        "fleet_rate_limited_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Record fleet error
pub fn record_error(shard_id: ShardId, error_type: &'static str) {
    counter!(
        "fleet_errors_total",
        "shard_id" => shard_id.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Set shards ready count
pub fn set_shards_ready(count: usize) {
    gauge!("fleet_shards_ready").set(count as f64);
}

/// Set average ping; unavailable ping is exported as NaN
pub fn set_average_ping(ping: Option<Duration>) {
    gauge!("fleet_average_ping_seconds").set(ping.map_or(f64::NAN, |p| p.as_secs_f64()));
}

/// Reset the launched gauge after shutdown
pub fn clear_launched() {
    gauge!("fleet_shards_launched").set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        record_launch_attempt(0);
        record_launched(0, 1);
        record_rate_limited(1);
        record_error(1, "rate_limited");
        set_shards_ready(1);
        set_average_ping(None);
        clear_launched();
    }
}
