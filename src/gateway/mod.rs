//! Gateway client contract
//!
//! The fleet treats every shard as an opaque connection resource. This module
//! defines the small surface it relies on: a factory that constructs one
//! client per shard id, the per-client queries and commands, and the event
//! listener hook used for readiness tracking.

mod model;
pub mod twilight;

pub use model::{ApplicationInfo, Game, GameKind, Guild, Presence, User};

use crate::error::{ClientError, LaunchError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use twilight_gateway::Intents;

/// Shard id within `[0, total)`
pub type ShardId = u32;

/// Position of one shard in the global shard space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub id: ShardId,
    pub total: u32,
}

/// Connection status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    /// Shard is opening its connection
    Connecting,
    /// Connection is open, identify in flight
    Identifying,
    /// Shard is ready and receiving events
    Connected,
    /// Shard is resuming after disconnect
    Resuming,
    /// Shard is disconnected
    Disconnected,
    /// Shutdown requested, close frame sent
    ShuttingDown,
    /// Shard encountered a fatal error
    Dead,
}

impl GatewayStatus {
    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, GatewayStatus::Connected | GatewayStatus::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, GatewayStatus::Connected)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            GatewayStatus::Connecting => 0,
            GatewayStatus::Identifying => 1,
            GatewayStatus::Connected => 2,
            GatewayStatus::Resuming => 3,
            GatewayStatus::Disconnected => 4,
            GatewayStatus::ShuttingDown => 5,
            GatewayStatus::Dead => 6,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => GatewayStatus::Connecting,
            1 => GatewayStatus::Identifying,
            2 => GatewayStatus::Connected,
            3 => GatewayStatus::Resuming,
            4 => GatewayStatus::Disconnected,
            5 => GatewayStatus::ShuttingDown,
            _ => GatewayStatus::Dead,
        }
    }
}

/// Lifecycle notification emitted by a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEvent {
    pub shard_id: ShardId,
    pub kind: ShardEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEventKind {
    /// Session established (READY)
    Ready,
    /// Session resumed after a reconnect
    Resumed,
    /// Connection lost
    Disconnected,
    /// Client shut down
    Shutdown,
}

/// Receives lifecycle events from every shard constructed with the template.
///
/// Called from the shard's event loop; implementations must not block.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &ShardEvent);

    /// Once true, the shard that dispatched the event drops this listener
    fn is_finished(&self) -> bool {
        false
    }
}

/// Shard-agnostic configuration applied to every shard of a fleet
#[derive(Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: Intents,
    pub presence: Presence,
    pub listeners: Vec<Arc<dyn EventListener>>,
    pub audio_enabled: bool,
    pub auto_reconnect: bool,
    pub proxy_url: Option<String>,
    pub websocket_timeout: Duration,
    pub large_threshold: u64,
}

impl ShardConfig {
    /// Forwards a shard event to every registered listener, then drops the
    /// listeners that are finished
    pub fn dispatch(&mut self, event: ShardEvent) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
        self.listeners.retain(|listener| !listener.is_finished());
    }

    pub fn emit(&mut self, shard_id: ShardId, kind: ShardEventKind) {
        self.dispatch(ShardEvent { shard_id, kind });
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: Intents::GUILDS | Intents::GUILD_MEMBERS,
            presence: Presence::default(),
            listeners: Vec::new(),
            audio_enabled: false,
            auto_reconnect: true,
            proxy_url: None,
            websocket_timeout: Duration::from_secs(60),
            large_threshold: 50,
        }
    }
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token is never logged
        f.debug_struct("ShardConfig")
            .field("intents", &self.intents)
            .field("presence", &self.presence)
            .field("listeners", &self.listeners.len())
            .field("audio_enabled", &self.audio_enabled)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("proxy_url", &self.proxy_url)
            .field("websocket_timeout", &self.websocket_timeout)
            .field("large_threshold", &self.large_threshold)
            .finish()
    }
}

/// One live gateway connection
#[async_trait]
pub trait GatewayClient: Send + Sync + 'static {
    fn shard_id(&self) -> ShardId;

    fn status(&self) -> GatewayStatus;

    /// Heartbeat latency, `None` until the first heartbeat is acknowledged
    fn ping(&self) -> Option<Duration>;

    fn guilds(&self) -> Vec<Guild>;

    fn users(&self) -> Vec<User>;

    fn set_presence(&self, presence: &Presence);

    /// Disconnects the shard. `free` also releases resources the client
    /// would otherwise share with other shards.
    fn shutdown(&self, free: bool) -> Result<(), ClientError>;

    /// Resolves once the connection task has finished after [`Self::shutdown`]
    async fn closed(&self) {}

    async fn application_info(&self) -> Result<ApplicationInfo, ClientError>;
}

/// Constructs gateway clients, one per shard id
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: GatewayClient;

    async fn create(
        &self,
        shard: ShardInfo,
        config: &ShardConfig,
    ) -> Result<Arc<Self::Client>, LaunchError>;

    /// Releases process-wide resources shared by all clients of this factory
    fn release_shared_resources(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn status_survives_atomic_encoding() {
        for status in [
            GatewayStatus::Connecting,
            GatewayStatus::Identifying,
            GatewayStatus::Connected,
            GatewayStatus::Resuming,
            GatewayStatus::Disconnected,
            GatewayStatus::ShuttingDown,
            GatewayStatus::Dead,
        ] {
            assert_eq!(GatewayStatus::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn only_connected_is_ready() {
        assert!(GatewayStatus::Connected.is_ready());
        assert!(!GatewayStatus::Resuming.is_ready());
        assert!(GatewayStatus::Resuming.is_healthy());
        assert!(!GatewayStatus::Dead.is_healthy());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ShardEvent>>);

    impl EventListener for Recorder {
        fn on_event(&self, event: &ShardEvent) {
            self.0.lock().push(*event);
        }
    }

    #[test]
    fn dispatch_reaches_every_listener() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let mut config = ShardConfig {
            listeners: vec![a.clone(), b.clone()],
            ..ShardConfig::default()
        };

        config.dispatch(ShardEvent {
            shard_id: 2,
            kind: ShardEventKind::Ready,
        });

        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock()[0].shard_id, 2);
    }

    struct UntilResumed(Recorder);

    impl EventListener for UntilResumed {
        fn on_event(&self, event: &ShardEvent) {
            self.0.on_event(event);
        }

        fn is_finished(&self) -> bool {
            self.0 .0.lock().iter().any(|e| e.kind == ShardEventKind::Resumed)
        }
    }

    #[test]
    fn finished_listeners_are_dropped_after_dispatch() {
        let kept = Arc::new(Recorder::default());
        let one_shot = Arc::new(UntilResumed(Recorder::default()));
        let mut config = ShardConfig {
            listeners: vec![kept.clone(), one_shot.clone()],
            ..ShardConfig::default()
        };

        config.emit(0, ShardEventKind::Ready);
        assert_eq!(config.listeners.len(), 2);

        config.emit(0, ShardEventKind::Resumed);
        config.emit(0, ShardEventKind::Disconnected);

        assert_eq!(config.listeners.len(), 1);
        assert_eq!(kept.0.lock().len(), 3);
        assert_eq!(one_shot.0 .0.lock().len(), 2);
    }

    #[test]
    fn debug_output_hides_token() {
        let config = ShardConfig {
            token: "secret-token".to_string(),
            ..ShardConfig::default()
        };
        assert!(!format!("{config:?}").contains("secret-token"));
    }
}
