//! Health check endpoints
//!
//! `/health` always answers while the process runs, `/ready` reflects the
//! fleet's launch progress and shard readiness, `/metrics` renders Prometheus.

use crate::gateway::{ClientFactory, ShardId};
use crate::shard::{LaunchState, ShardManager};
use crate::telemetry::{self, FleetMetrics};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shard_lower: ShardId,
    pub shard_upper: ShardId,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub launch_state: &'static str,
    pub shards_total: u32,
    pub shards_expected: usize,
    pub shards_launched: usize,
    pub shards_ready: usize,
    pub average_ping_ms: Option<u64>,
}

/// Application state for health endpoints
pub struct AppState<F: ClientFactory> {
    pub fleet: ShardManager<F>,
    pub metrics: Option<FleetMetrics>,
}

impl<F: ClientFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            fleet: self.fleet.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

fn launch_state_label(state: &LaunchState) -> &'static str {
    match state {
        LaunchState::Launching => "launching",
        LaunchState::Complete => "complete",
        LaunchState::Aborted { .. } => "aborted",
        LaunchState::ShutDown => "shut_down",
    }
}

/// Create the health check router
pub fn router<F: ClientFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<F>))
        .route("/ready", get(ready_handler::<F>))
        .route("/metrics", get(metrics_handler::<F>))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler<F: ClientFactory>(State(state): State<AppState<F>>) -> impl IntoResponse {
    let range = state.fleet.range();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shard_lower: range.lower(),
        shard_upper: range.upper(),
    })
}

/// Build the readiness report for a fleet
pub fn ready_report<F: ClientFactory>(fleet: &ShardManager<F>) -> ReadyResponse {
    let launch_state = fleet.launch_state();
    let shards_expected = fleet.range().len();
    let shards_ready = fleet.ready_count();

    ReadyResponse {
        ready: launch_state == LaunchState::Complete && shards_ready == shards_expected,
        launch_state: launch_state_label(&launch_state),
        shards_total: fleet.shards_total(),
        shards_expected,
        shards_launched: fleet.launched_count(),
        shards_ready,
        average_ping_ms: fleet
            .average_ping()
            .map(|ping| u64::try_from(ping.as_millis()).unwrap_or(u64::MAX)),
    }
}

/// Readiness endpoint - returns 200 once every shard is launched and ready
async fn ready_handler<F: ClientFactory>(State(state): State<AppState<F>>) -> impl IntoResponse {
    let response = ready_report(&state.fleet);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler<F: ClientFactory>(State(state): State<AppState<F>>) -> impl IntoResponse {
    // Update current metrics
    telemetry::set_shards_ready(state.fleet.ready_count());
    telemetry::set_average_ping(state.fleet.average_ping());

    let body = state.metrics.as_ref().map(FleetMetrics::render).unwrap_or_default();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
}
