//! Scripted gateway client factory for fleet tests

#![allow(dead_code)]

use arrakis_shards::error::{ClientError, LaunchError};
use arrakis_shards::gateway::{
    ApplicationInfo, ClientFactory, GatewayClient, GatewayStatus, Guild, Presence, ShardConfig,
    ShardEventKind, ShardId, ShardInfo, User,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use twilight_model::id::Id;

pub const TOKEN: &str = "test-token";

/// Scripted result of one `create` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Launch,
    RateLimited,
    InvalidCredentials,
    InvalidArgument,
    Fail,
}

/// When constructed shards report READY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyMode {
    /// Never; the test emits READY through [`MockFactory::emit_ready`]
    Manual,
    /// Once, during construction
    OnCreate,
    /// Twice, during construction
    TwiceOnCreate,
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub shard: ShardInfo,
    pub at: Instant,
    pub presence: Presence,
}

pub struct MockFactory {
    script: Mutex<HashMap<ShardId, VecDeque<Outcome>>>,
    ready_mode: ReadyMode,
    pings: HashMap<ShardId, Duration>,
    entities: HashMap<ShardId, (Vec<Guild>, Vec<User>)>,
    failing_shutdown: Vec<ShardId>,
    build_delays: HashMap<ShardId, Duration>,
    attempts: Mutex<Vec<AttemptRecord>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
    configs: Mutex<HashMap<ShardId, ShardConfig>>,
    releases: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            ready_mode: ReadyMode::OnCreate,
            pings: HashMap::new(),
            entities: HashMap::new(),
            failing_shutdown: Vec::new(),
            build_delays: HashMap::new(),
            attempts: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            configs: Mutex::new(HashMap::new()),
            releases: AtomicUsize::new(0),
        }
    }

    /// Outcomes returned for `shard_id` before it launches successfully
    pub fn script(self, shard_id: ShardId, outcomes: &[Outcome]) -> Self {
        self.script
            .lock()
            .insert(shard_id, outcomes.iter().copied().collect());
        self
    }

    pub fn ready_mode(mut self, mode: ReadyMode) -> Self {
        self.ready_mode = mode;
        self
    }

    pub fn ping(mut self, shard_id: ShardId, ping: Duration) -> Self {
        self.pings.insert(shard_id, ping);
        self
    }

    pub fn entities(mut self, shard_id: ShardId, guilds: Vec<Guild>, users: Vec<User>) -> Self {
        self.entities.insert(shard_id, (guilds, users));
        self
    }

    pub fn failing_shutdown(mut self, shard_id: ShardId) -> Self {
        self.failing_shutdown.push(shard_id);
        self
    }

    /// Make every construction of `shard_id` take `delay`
    pub fn build_delay(mut self, shard_id: ShardId, delay: Duration) -> Self {
        self.build_delays.insert(shard_id, delay);
        self
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.attempts.lock().clone()
    }

    pub fn attempted_ids(&self) -> Vec<ShardId> {
        self.attempts.lock().iter().map(|a| a.shard.id).collect()
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }

    pub fn client(&self, shard_id: ShardId) -> Option<Arc<MockClient>> {
        self.clients
            .lock()
            .iter()
            .find(|c| c.shard_id == shard_id)
            .cloned()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Deliver READY for `shard_id` to the listeners it still holds
    pub fn emit_ready(&self, shard_id: ShardId) {
        if let Some(config) = self.configs.lock().get_mut(&shard_id) {
            config.emit(shard_id, ShardEventKind::Ready);
        }
    }

    /// Listeners `shard_id` still dispatches to
    pub fn listener_count(&self, shard_id: ShardId) -> usize {
        self.configs
            .lock()
            .get(&shard_id)
            .map_or(0, |config| config.listeners.len())
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    type Client = MockClient;

    async fn create(
        &self,
        shard: ShardInfo,
        config: &ShardConfig,
    ) -> Result<Arc<MockClient>, LaunchError> {
        self.attempts.lock().push(AttemptRecord {
            shard,
            at: Instant::now(),
            presence: config.presence.clone(),
        });

        if let Some(delay) = self.build_delays.get(&shard.id) {
            tokio::time::sleep(*delay).await;
        }

        let outcome = self
            .script
            .lock()
            .get_mut(&shard.id)
            .and_then(|outcomes| outcomes.pop_front())
            .unwrap_or(Outcome::Launch);

        match outcome {
            Outcome::Launch => {}
            Outcome::RateLimited => return Err(LaunchError::RateLimited { retry_after: None }),
            Outcome::InvalidCredentials => return Err(LaunchError::InvalidCredentials),
            Outcome::InvalidArgument => {
                return Err(LaunchError::InvalidArgument("bad template".to_string()))
            }
            Outcome::Fail => {
                return Err(LaunchError::Other(Box::new(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                ))))
            }
        }

        let (guilds, users) = self.entities.get(&shard.id).cloned().unwrap_or_default();
        let client = Arc::new(MockClient {
            shard_id: shard.id,
            status: Mutex::new(GatewayStatus::Connecting),
            ping: self.pings.get(&shard.id).copied(),
            guilds,
            users,
            presences: Mutex::new(vec![config.presence.clone()]),
            shutdowns: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            fail_shutdown: self.failing_shutdown.contains(&shard.id),
        });

        let mut config = config.clone();
        let readies = match self.ready_mode {
            ReadyMode::Manual => 0,
            ReadyMode::OnCreate => 1,
            ReadyMode::TwiceOnCreate => 2,
        };
        for _ in 0..readies {
            *client.status.lock() = GatewayStatus::Connected;
            config.emit(shard.id, ShardEventKind::Ready);
        }

        self.clients.lock().push(Arc::clone(&client));
        self.configs.lock().insert(shard.id, config);

        Ok(client)
    }

    fn release_shared_resources(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockClient {
    pub shard_id: ShardId,
    pub status: Mutex<GatewayStatus>,
    ping: Option<Duration>,
    guilds: Vec<Guild>,
    users: Vec<User>,
    presences: Mutex<Vec<Presence>>,
    shutdowns: Mutex<Vec<bool>>,
    closed: AtomicUsize,
    fail_shutdown: bool,
}

impl MockClient {
    /// Presence the shard was built with, followed by every update it received
    pub fn presences(&self) -> Vec<Presence> {
        self.presences.lock().clone()
    }

    pub fn last_presence(&self) -> Option<Presence> {
        self.presences.lock().last().cloned()
    }

    /// `free` flag of every shutdown call
    pub fn shutdowns(&self) -> Vec<bool> {
        self.shutdowns.lock().clone()
    }

    /// Times the fleet waited for this client to finish closing
    pub fn closed_waits(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayClient for MockClient {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn status(&self) -> GatewayStatus {
        *self.status.lock()
    }

    fn ping(&self) -> Option<Duration> {
        self.ping
    }

    fn guilds(&self) -> Vec<Guild> {
        self.guilds.clone()
    }

    fn users(&self) -> Vec<User> {
        self.users.clone()
    }

    fn set_presence(&self, presence: &Presence) {
        self.presences.lock().push(presence.clone());
    }

    fn shutdown(&self, free: bool) -> Result<(), ClientError> {
        self.shutdowns.lock().push(free);
        *self.status.lock() = GatewayStatus::ShuttingDown;
        if self.fail_shutdown {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn application_info(&self) -> Result<ApplicationInfo, ClientError> {
        Ok(ApplicationInfo {
            id: Id::new(1000 + u64::from(self.shard_id)),
            name: format!("arrakis-{}", self.shard_id),
            description: "test application".to_string(),
            bot_public: false,
        })
    }
}

pub fn guild(id: u64, name: &str) -> Guild {
    Guild {
        id: Id::new(id),
        name: Some(name.to_string()),
    }
}

pub fn user(id: u64, name: &str) -> User {
    User {
        id: Id::new(id),
        name: name.to_string(),
        bot: false,
    }
}
