//! Readiness barrier
//!
//! Counts READY events from the shards of a launch and releases waiters once
//! every shard in the range has reported ready. Each shard listens through
//! its own [`ReadySubscription`]: the first READY consumes it, the shard's
//! dispatcher then drops it, and any redelivery is ignored.
//!
//! The count and the outcome live in one `watch` value, so a waiter checks
//! "already released?" under the same synchronization the listener uses to
//! update it. A release that happens before `wait` is called is never lost.

use crate::error::FleetError;
use crate::gateway::{EventListener, ShardEvent, ShardEventKind, ShardId};
use crate::shard::ShardRange;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Why a barrier was released without every shard reporting ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierCancel {
    Aborted { shard_id: ShardId, reason: String },
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Released,
    Cancelled(BarrierCancel),
}

#[derive(Debug, Default)]
struct BarrierState {
    ready: HashSet<ShardId>,
    outcome: Option<Outcome>,
}

/// Blocks a launch until `range.len()` distinct shards are ready
#[derive(Debug)]
pub struct ReadyBarrier {
    range: ShardRange,
    state: watch::Sender<BarrierState>,
}

impl ReadyBarrier {
    pub fn new(range: ShardRange) -> Self {
        let (state, _) = watch::channel(BarrierState::default());
        Self { range, state }
    }

    /// Number of shards required to release the barrier
    pub fn target(&self) -> usize {
        self.range.len()
    }

    /// Number of distinct shards that reported ready so far
    pub fn ready_count(&self) -> usize {
        self.state.borrow().ready.len()
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state.borrow().outcome, Some(Outcome::Released))
    }

    /// Released or cancelled
    pub fn is_settled(&self) -> bool {
        self.state.borrow().outcome.is_some()
    }

    /// One-shot READY subscription for a single shard
    pub fn subscribe(self: &Arc<Self>, shard_id: ShardId) -> Arc<ReadySubscription> {
        Arc::new(ReadySubscription {
            barrier: Arc::clone(self),
            shard_id,
            delivered: AtomicBool::new(false),
        })
    }

    /// Counts `shard_id` as ready. Returns false if the shard was already
    /// counted, lies outside the range, or the barrier is settled.
    pub fn arrive(&self, shard_id: ShardId) -> bool {
        if !self.range.contains(shard_id) {
            return false;
        }

        let target = self.target();
        let counted = self.state.send_if_modified(|state| {
            if state.outcome.is_some() || !state.ready.insert(shard_id) {
                return false;
            }
            if state.ready.len() >= target {
                state.outcome = Some(Outcome::Released);
            }
            true
        });

        if counted {
            let ready = self.ready_count();
            debug!(shard_id, ready, target, "Shard reported ready");
            if ready >= target {
                info!(target, "All shards ready");
            }
        }
        counted
    }

    /// Releases waiters with an error. No effect once the barrier is settled.
    pub fn cancel(&self, reason: BarrierCancel) {
        self.state.send_if_modified(|state| {
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(Outcome::Cancelled(reason));
            true
        });
    }

    /// Waits until every shard is ready or the barrier is cancelled
    pub async fn wait(&self) -> Result<(), FleetError> {
        let mut rx = self.state.subscribe();
        let outcome = rx
            .wait_for(|state| state.outcome.is_some())
            .await
            .map_err(|_| FleetError::ShutDown)?
            .outcome
            .clone();

        match outcome {
            Some(Outcome::Released) | None => Ok(()),
            Some(Outcome::Cancelled(BarrierCancel::ShutDown)) => Err(FleetError::ShutDown),
            Some(Outcome::Cancelled(BarrierCancel::Aborted { shard_id, reason })) => {
                Err(FleetError::LaunchAborted { shard_id, reason })
            }
        }
    }
}

/// Forwards the first READY of one shard to its barrier
#[derive(Debug)]
pub struct ReadySubscription {
    barrier: Arc<ReadyBarrier>,
    shard_id: ShardId,
    delivered: AtomicBool,
}

impl EventListener for ReadySubscription {
    fn on_event(&self, event: &ShardEvent) {
        if event.kind != ShardEventKind::Ready || event.shard_id != self.shard_id {
            return;
        }
        if !self.delivered.swap(true, Ordering::SeqCst) {
            self.barrier.arrive(self.shard_id);
        }
    }

    fn is_finished(&self) -> bool {
        self.delivered.load(Ordering::SeqCst) || self.barrier.is_settled()
    }
}
