//! Shard fleet registry
//!
//! Holds the launched shards of one fleet and serves fleet-wide queries while
//! the launcher is still appending in the background. Shards are inserted at
//! most once and only removed by [`ShardManager::shutdown`].

use crate::error::FleetError;
use crate::gateway::{
    ApplicationInfo, ClientFactory, Game, GatewayClient, GatewayStatus, Guild, Presence,
    ShardConfig, ShardId, User,
};
use crate::shard::barrier::{BarrierCancel, ReadyBarrier};
use crate::shard::ShardRange;
use crate::telemetry;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twilight_model::gateway::presence::Status;

/// Progress of the background launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchState {
    /// Shards are still being constructed
    Launching,
    /// Every shard in the range has been constructed
    Complete,
    /// Launch gave up at `shard_id`; shards below it stay up
    Aborted { shard_id: ShardId, reason: String },
    /// Fleet was shut down
    ShutDown,
}

/// Handle to a running shard fleet
///
/// Cheap to clone; all clones share the same fleet.
pub struct ShardManager<F: ClientFactory> {
    pub(super) inner: Arc<FleetInner<F>>,
}

impl<F: ClientFactory> Clone for ShardManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(super) struct FleetInner<F: ClientFactory> {
    pub(super) range: ShardRange,
    pub(super) factory: Arc<F>,
    pub(super) template: ShardConfig,
    pub(super) shards: DashMap<ShardId, Arc<F::Client>>,
    /// Next shard id the launcher will attempt
    pub(super) cursor: AtomicU32,
    pub(super) shutdown: AtomicBool,
    pub(super) cancel: CancellationToken,
    pub(super) launcher: Mutex<Option<JoinHandle<()>>>,
    pub(super) state: watch::Sender<LaunchState>,
    pub(super) presence: Mutex<Presence>,
    pub(super) barrier: Option<Arc<ReadyBarrier>>,
    /// Shards disconnected by shutdown whose connections may still be closing
    pub(super) closing: Mutex<Vec<Arc<F::Client>>>,
}

impl<F: ClientFactory> FleetInner<F> {
    pub(super) fn new(
        range: ShardRange,
        factory: Arc<F>,
        template: ShardConfig,
        barrier: Option<Arc<ReadyBarrier>>,
    ) -> Self {
        let (state, _) = watch::channel(LaunchState::Launching);
        let presence = template.presence.clone();

        Self {
            range,
            factory,
            template,
            shards: DashMap::with_capacity(range.len()),
            cursor: AtomicU32::new(range.lower()),
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            launcher: Mutex::new(None),
            state,
            presence: Mutex::new(presence),
            barrier,
            closing: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Template for `shard_id` carrying the most recently broadcast presence
    /// and, while a launch is being awaited, the shard's ready subscription
    pub(super) fn shard_config(&self, shard_id: ShardId) -> ShardConfig {
        let mut config = self.template.clone();
        config.presence = self.presence.lock().clone();
        if let Some(barrier) = self.barrier.as_ref().filter(|b| !b.is_settled()) {
            config.listeners.push(barrier.subscribe(shard_id));
        }
        config
    }

    /// Insert a freshly constructed shard and advance the cursor.
    ///
    /// Returns false if the fleet was shut down while the shard was being
    /// built; the client is disconnected instead of being inserted.
    pub(super) fn register(
        &self,
        shard_id: ShardId,
        client: Arc<F::Client>,
        built_with: &Presence,
    ) -> bool {
        // The shutdown check happens under the entry lock, so shutdown either
        // sees this shard when draining or this insert sees the flag.
        let inserted = match self.shards.entry(shard_id) {
            Entry::Occupied(_) => {
                warn!(shard_id, "Shard already registered, discarding duplicate");
                false
            }
            Entry::Vacant(slot) => {
                if self.is_shut_down() {
                    false
                } else {
                    slot.insert(Arc::clone(&client));
                    true
                }
            }
        };

        if !inserted {
            if let Err(e) = client.shutdown(false) {
                warn!(shard_id, error = %e, "Failed to disconnect discarded shard");
            }
            return false;
        }

        self.cursor.store(shard_id + 1, Ordering::SeqCst);
        telemetry::record_launched(shard_id, self.shards.len());

        // A broadcast may have landed while this shard was being built
        let current = self.presence.lock();
        if *current != *built_with {
            client.set_presence(&current);
        }

        true
    }

    pub(super) fn set_state(&self, state: LaunchState) {
        self.state.send_if_modified(|current| {
            // ShutDown is terminal
            if *current == LaunchState::ShutDown || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub(super) fn abort(&self, shard_id: ShardId, reason: String) {
        if let Some(barrier) = &self.barrier {
            barrier.cancel(BarrierCancel::Aborted {
                shard_id,
                reason: reason.clone(),
            });
        }
        self.set_state(LaunchState::Aborted { shard_id, reason });
    }
}

impl<F: ClientFactory> ShardManager<F> {
    /// Total number of shards across all processes
    pub fn shards_total(&self) -> u32 {
        self.inner.range.total()
    }

    /// Shard range owned by this fleet
    pub fn range(&self) -> ShardRange {
        self.inner.range
    }

    fn check_shard_id(&self, shard_id: ShardId) -> Result<(), FleetError> {
        let total = self.shards_total();
        if shard_id >= total {
            return Err(FleetError::OutOfRange { shard_id, total });
        }
        Ok(())
    }

    /// Get a launched shard. `Ok(None)` if the shard has not been launched
    /// (yet) by this fleet. Never waits for the launcher.
    pub fn get_shard(&self, shard_id: ShardId) -> Result<Option<Arc<F::Client>>, FleetError> {
        self.check_shard_id(shard_id)?;
        Ok(self
            .inner
            .shards
            .get(&shard_id)
            .map(|entry| Arc::clone(entry.value())))
    }

    /// Snapshot of every launched shard, ordered by shard id
    pub fn shards(&self) -> Vec<Arc<F::Client>> {
        let mut shards: Vec<(ShardId, Arc<F::Client>)> = self
            .inner
            .shards
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        shards.sort_unstable_by_key(|(shard_id, _)| *shard_id);
        shards.into_iter().map(|(_, client)| client).collect()
    }

    /// Status of a single shard, `Ok(None)` if it has not been launched
    pub fn status(&self, shard_id: ShardId) -> Result<Option<GatewayStatus>, FleetError> {
        Ok(self.get_shard(shard_id)?.map(|client| client.status()))
    }

    /// Status of every launched shard, ordered by shard id
    pub fn statuses(&self) -> Vec<(ShardId, GatewayStatus)> {
        self.shards()
            .iter()
            .map(|client| (client.shard_id(), client.status()))
            .collect()
    }

    /// Mean heartbeat latency over launched shards that have measured one.
    ///
    /// Returns `None` when no shard has launched or none has a measurement.
    pub fn average_ping(&self) -> Option<Duration> {
        let pings: Vec<Duration> = self.shards().iter().filter_map(|c| c.ping()).collect();
        if pings.is_empty() {
            return None;
        }
        let total: Duration = pings.iter().sum();
        Some(total / pings.len() as u32)
    }

    /// Guilds across all launched shards, each guild once
    pub fn guilds(&self) -> Vec<Guild> {
        let mut seen = HashSet::new();
        self.shards()
            .iter()
            .flat_map(|client| client.guilds())
            .filter(|guild| seen.insert(guild.id))
            .collect()
    }

    /// Users across all launched shards, each user once even when several
    /// shards share them
    pub fn users(&self) -> Vec<User> {
        let mut seen = HashSet::new();
        self.shards()
            .iter()
            .flat_map(|client| client.users())
            .filter(|user| seen.insert(user.id))
            .collect()
    }

    /// Application metadata. Always served by shard 0, whichever range this
    /// fleet owns.
    pub async fn application_info(&self) -> Result<ApplicationInfo, FleetError> {
        let shard = self
            .get_shard(0)?
            .ok_or(FleetError::ShardNotLaunched { shard_id: 0 })?;

        shard
            .application_info()
            .await
            .map_err(|source| FleetError::Client {
                shard_id: 0,
                source,
            })
    }

    /// Most recently broadcast presence
    pub fn presence(&self) -> Presence {
        self.inner.presence.lock().clone()
    }

    pub fn set_game(&self, game: Option<Game>) -> Result<(), FleetError> {
        self.update_presence(|presence| presence.game = game)
    }

    pub fn set_idle(&self, idle: bool) -> Result<(), FleetError> {
        self.update_presence(|presence| presence.afk = idle)
    }

    pub fn set_status(&self, status: Status) -> Result<(), FleetError> {
        self.update_presence(|presence| presence.status = status)
    }

    /// Store the new presence and broadcast it to every launched shard.
    /// Shards launched later are built with it.
    fn update_presence(&self, apply: impl FnOnce(&mut Presence)) -> Result<(), FleetError> {
        if self.inner.is_shut_down() {
            return Err(FleetError::ShutDown);
        }

        // Held while broadcasting so concurrent updates reach shards in order
        let mut presence = self.inner.presence.lock();
        apply(&mut presence);

        let shards = self.shards();
        debug!(shards = shards.len(), presence = ?*presence, "Broadcasting presence");
        for client in shards {
            client.set_presence(&presence);
        }
        Ok(())
    }

    /// Number of shards currently held by the fleet
    pub fn launched_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Ready shards among the launched ones
    pub fn ready_count(&self) -> usize {
        self.shards()
            .iter()
            .filter(|client| client.status().is_ready())
            .count()
    }

    /// True once every shard in the range has been constructed
    pub fn is_fully_launched(&self) -> bool {
        self.inner.cursor.load(Ordering::SeqCst) > self.inner.range.upper()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    pub fn launch_state(&self) -> LaunchState {
        self.inner.state.borrow().clone()
    }

    /// Waits until the launch completes, aborts, or the fleet shuts down
    pub async fn wait_for_launch(&self) -> LaunchState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|state| *state != LaunchState::Launching).await {
            Ok(state) => state.clone(),
            Err(_) => LaunchState::ShutDown,
        };
        state
    }

    /// Waits until every shard disconnected by [`Self::shutdown`] has finished
    /// closing its connection. Does not return before shutdown has run.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let shut_down = rx
            .wait_for(|state| *state == LaunchState::ShutDown)
            .await
            .is_ok();
        if !shut_down {
            return;
        }

        let closing = std::mem::take(&mut *self.inner.closing.lock());
        for client in closing {
            client.closed().await;
        }
    }

    /// Shut down and release shared resources
    pub fn shutdown_default(&self) {
        self.shutdown(true);
    }

    /// Shut the fleet down. Only the first call has any effect.
    ///
    /// Stops the launcher, disconnects every launched shard without freeing
    /// shared resources, then releases the factory's shared resources once
    /// if `release_shared_resources` is set.
    pub fn shutdown(&self, release_shared_resources: bool) {
        let inner = &self.inner;
        if inner
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already requested");
            return;
        }

        info!(
            lower = inner.range.lower(),
            upper = inner.range.upper(),
            launched = inner.shards.len(),
            "Shutting down shard fleet"
        );

        inner.cancel.cancel();
        if let Some(handle) = inner.launcher.lock().take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        if let Some(barrier) = &inner.barrier {
            barrier.cancel(BarrierCancel::ShutDown);
        }

        let mut shard_ids: Vec<ShardId> = inner.shards.iter().map(|entry| *entry.key()).collect();
        shard_ids.sort_unstable();

        // Sequential; one shard failing to disconnect does not stop the rest
        for shard_id in shard_ids {
            let Some((_, client)) = inner.shards.remove(&shard_id) else {
                continue;
            };
            if let Err(e) = client.shutdown(false) {
                telemetry::record_error(shard_id, "disconnect");
                warn!(shard_id, error = %e, "Failed to disconnect shard");
            }
            inner.closing.lock().push(client);
        }
        telemetry::clear_launched();

        if release_shared_resources {
            inner.factory.release_shared_resources();
            debug!("Released shared resources");
        }

        inner.state.send_replace(LaunchState::ShutDown);
        info!("Shard fleet shut down");
    }
}
