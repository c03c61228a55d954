//! Domain error types for the Arrakis shard fleet
//!
//! One enum per seam:
//! - [`FleetError`]: returned to callers of the builder and the fleet handle
//! - [`LaunchError`]: returned by a [`ClientFactory`](crate::gateway::ClientFactory)
//!   when a single shard cannot be constructed
//! - [`ClientError`]: returned by an individual gateway client
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).

use crate::gateway::ShardId;
use std::time::Duration;
use thiserror::Error;

/// Boxed source error carried across trait seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fleet domain errors
///
/// Every variant carries structured context fields for diagnostics, so the
/// failure mode is visible from the variant alone.
///
/// Example log output:
/// ```text
/// FleetError::OutOfRange { shard_id: 12, total: 10 }
/// → "shard 12 is out of range for a fleet of 10 shards"
/// ```
#[derive(Error, Debug)]
pub enum FleetError {
    /// Invalid shard total, shard range or shard template
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The first shard was rejected because the token is not valid
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A shard id outside `[0, total)` was requested
    #[error("shard {shard_id} is out of range for a fleet of {total} shards")]
    OutOfRange { shard_id: ShardId, total: u32 },

    /// The shard exists in the id space but has not been launched by this fleet
    #[error("shard {shard_id} has not been launched")]
    ShardNotLaunched { shard_id: ShardId },

    /// Background launch gave up on a shard; remaining shards were not launched
    #[error("launch aborted at shard {shard_id}: {reason}")]
    LaunchAborted { shard_id: ShardId, reason: String },

    /// The fleet was shut down before the operation could complete
    #[error("fleet has been shut down")]
    ShutDown,

    /// A gateway client failed while serving a fleet operation
    #[error("shard {shard_id} client error")]
    Client {
        shard_id: ShardId,
        #[source]
        source: ClientError,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `fleet_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidCredentials => "invalid_credentials",
            Self::OutOfRange { .. } => "out_of_range",
            Self::ShardNotLaunched { .. } => "not_launched",
            Self::LaunchAborted { .. } => "launch_aborted",
            Self::ShutDown => "shut_down",
            Self::Client { .. } => "client",
            Self::Config(_) => "config",
        }
    }
}

/// Failure to construct a single shard
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The token was refused by the remote service
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The shard template or shard id cannot be used
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Identify rate limit hit; the same shard id must be retried later
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other construction failure
    #[error("shard construction failed: {0}")]
    Other(#[source] BoxError),
}

impl LaunchError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::RateLimited { .. } => "rate_limited",
            Self::Other(_) => "launch_other",
        }
    }

    /// Returns true if the error is the identify rate limit
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Converts a construction failure of `shard_id` into the caller-facing error
    pub fn into_fleet_error(self, shard_id: ShardId) -> FleetError {
        match self {
            Self::InvalidCredentials => FleetError::InvalidCredentials,
            Self::InvalidArgument(msg) => FleetError::InvalidArgument(msg),
            other => FleetError::LaunchAborted {
                shard_id,
                reason: other.to_string(),
            },
        }
    }
}

/// Failure reported by a single gateway client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The command could not be handed to the shard's connection
    #[error("failed to send {command} to the gateway")]
    Send {
        command: &'static str,
        #[source]
        source: BoxError,
    },

    /// REST request made on behalf of the shard failed
    #[error("REST request failed")]
    Http(#[source] BoxError),

    /// The client has already been shut down
    #[error("client is shut down")]
    Closed,
}
