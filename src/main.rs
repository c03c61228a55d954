//! Arrakis shard fleet - runs one process's range of Discord shards
//!
//! - Launches the configured shard range through the staggered launcher
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use arrakis_shards::config::FleetConfig;
use arrakis_shards::gateway::twilight::TwilightFactory;
use arrakis_shards::health::{self, AppState};
use arrakis_shards::shard::LaunchState;
use arrakis_shards::telemetry::FleetMetrics;

/// Upper bound on waiting for shards to flush their close frames
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let fleet_config = FleetConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shards={}", fleet_config.log_level).parse()?)
                .add_directive("twilight_gateway=info".parse()?)
                .add_directive("twilight_http=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        total_shards = fleet_config.total_shards,
        shard_lower = ?fleet_config.shard_lower,
        shard_upper = ?fleet_config.shard_upper,
        "Starting Arrakis shard fleet"
    );

    let metrics = FleetMetrics::install()?;
    info!("Prometheus metrics initialized");

    let builder = fleet_config.builder()?;
    let factory = Arc::new(TwilightFactory::new());

    let fleet = if fleet_config.wait_for_ready {
        builder.launch_blocking(factory).await?
    } else {
        builder.launch_async(factory).await?
    };

    info!(
        shard_lower = fleet.range().lower(),
        shard_upper = fleet.range().upper(),
        launched = fleet.launched_count(),
        "Shard fleet started"
    );

    let watcher = fleet.clone();
    tokio::spawn(async move {
        match watcher.wait_for_launch().await {
            LaunchState::Aborted { shard_id, reason } => {
                error!(shard_id, %reason, "Shard launch aborted");
            }
            state => info!(?state, "Shard launch finished"),
        }
    });

    // Start health server
    let app_state = AppState {
        fleet: fleet.clone(),
        metrics: Some(metrics),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], fleet_config.http_port).into();

    info!(port = fleet_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        health_router,
    );

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down shard fleet...");
    fleet.shutdown(true);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, fleet.closed()).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "Shards did not close in time");
    }

    info!("Shard fleet shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
