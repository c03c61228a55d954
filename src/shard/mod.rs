//! Shard fleet management
//!
//! Brings up a fixed range of shards one at a time, tracks them as one
//! fleet, and tears the whole fleet down exactly once.

mod barrier;
mod builder;
mod launcher;
mod manager;
mod range;

pub use barrier::{BarrierCancel, ReadyBarrier, ReadySubscription};
pub use builder::ShardManagerBuilder;
pub use launcher::{LAUNCH_INTERVAL, MAX_LAUNCH_ATTEMPTS};
pub use manager::{LaunchState, ShardManager};
pub use range::ShardRange;
