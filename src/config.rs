//! Fleet process configuration
//!
//! Loaded from `.env` (via dotenvy) and environment variables, layered over
//! defaults with the `config` crate.

use crate::error::FleetError;
use crate::shard::ShardManagerBuilder;
use serde::Deserialize;
use std::time::Duration;
use twilight_gateway::Intents;

/// Fleet process configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Discord bot token
    #[serde(default)]
    pub discord_token: String,

    /// Total number of shards across all processes
    pub total_shards: u32,

    /// First shard this process owns (inclusive)
    pub shard_lower: Option<u32>,

    /// Last shard this process owns (inclusive)
    pub shard_upper: Option<u32>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Block startup until every shard is ready
    pub wait_for_ready: bool,

    /// Seconds without a gateway message before a shard is considered stalled
    pub websocket_timeout_secs: u64,
}

impl FleetConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, FleetError> {
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    /// Load configuration from an explicit source layered over the defaults
    pub fn from_source<S>(source: S) -> Result<Self, FleetError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .set_default("total_shards", 1)
            .and_then(|b| b.set_default("http_port", 9090))
            .and_then(|b| b.set_default("log_level", "info"))
            .and_then(|b| b.set_default("wait_for_ready", false))
            .and_then(|b| b.set_default("websocket_timeout_secs", 60))
            .map_err(|e| FleetError::Config(e.to_string()))?
            .add_source(source)
            .build()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        let mut fleet: Self = settings
            .try_deserialize()
            .map_err(|e| FleetError::Config(e.to_string()))?;

        if fleet.discord_token.is_empty() {
            // Backwards compat
            fleet.discord_token = std::env::var("DISCORD_BOT_TOKEN").unwrap_or_default();
        }

        fleet.validate()?;
        Ok(fleet)
    }

    fn validate(&self) -> Result<(), FleetError> {
        if self.discord_token.trim().is_empty() {
            return Err(FleetError::Config(
                "DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string(),
            ));
        }
        if self.total_shards == 0 {
            return Err(FleetError::Config(
                "TOTAL_SHARDS must be positive".to_string(),
            ));
        }
        if self.shard_lower.is_some() != self.shard_upper.is_some() {
            return Err(FleetError::Config(
                "SHARD_LOWER and SHARD_UPPER must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Get configured Discord intents
    ///
    /// Minimal intents, no privileged message content:
    /// - GUILDS: Required for guild lifecycle events
    /// - GUILD_MEMBERS: Required for member events (privileged)
    pub fn intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MEMBERS
    }

    /// Builder preconfigured from this configuration
    pub fn builder(&self) -> Result<ShardManagerBuilder, FleetError> {
        let mut builder = ShardManagerBuilder::new(self.total_shards)?
            .token(self.discord_token.clone())
            .intents(Self::intents())
            .websocket_timeout(Duration::from_secs(self.websocket_timeout_secs));

        if let (Some(lower), Some(upper)) = (self.shard_lower, self.shard_upper) {
            builder = builder.shard_range(lower, upper)?;
        }
        Ok(builder)
    }
}
