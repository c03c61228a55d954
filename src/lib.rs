//! Arrakis shard fleet
//!
//! Runs a range of Discord gateway shards for one bot as a single fleet:
//! - Launches shards one at a time to respect the identify rate limit
//! - Serves fleet-wide queries (status, ping, guilds, users) during launch
//! - Broadcasts presence to every shard, including shards launched later
//! - Shuts the whole fleet down exactly once

pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod shard;
pub mod telemetry;

pub use error::{ClientError, FleetError, LaunchError};
pub use gateway::{
    ClientFactory, EventListener, GatewayClient, GatewayStatus, ShardConfig, ShardEvent,
    ShardEventKind, ShardId, ShardInfo,
};
pub use shard::{LaunchState, ShardManager, ShardManagerBuilder, ShardRange};
