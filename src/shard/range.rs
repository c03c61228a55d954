//! Shard id ranges
//!
//! A fleet is responsible for an inclusive sub-range of `[0, total)`, which
//! lets several processes split one bot's shard space between them.

use crate::error::FleetError;
use crate::gateway::ShardId;

/// Inclusive shard id range `lower..=upper` within `[0, total)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ShardRange {
    lower: ShardId,
    upper: ShardId,
    total: u32,
}

impl ShardRange {
    /// Create a validated range
    pub fn new(lower: ShardId, upper: ShardId, total: u32) -> Result<Self, FleetError> {
        if total == 0 {
            return Err(FleetError::InvalidArgument(
                "shards total must be positive".to_string(),
            ));
        }
        if lower > upper {
            return Err(FleetError::InvalidArgument(format!(
                "lower bound {lower} must be lower than or equal to upper bound {upper}"
            )));
        }
        if upper >= total {
            return Err(FleetError::InvalidArgument(format!(
                "upper bound {upper} must be lower than shards total {total}"
            )));
        }

        Ok(Self { lower, upper, total })
    }

    /// The whole shard space `[0, total - 1]`
    pub fn full(total: u32) -> Result<Self, FleetError> {
        Self::new(0, total.saturating_sub(1), total)
    }

    pub fn lower(&self) -> ShardId {
        self.lower
    }

    pub fn upper(&self) -> ShardId {
        self.upper
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Number of shards in the range
    pub fn len(&self) -> usize {
        (self.upper - self.lower) as usize + 1
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        (self.lower..=self.upper).contains(&shard_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = ShardId> {
        self.lower..=self.upper
    }
}
