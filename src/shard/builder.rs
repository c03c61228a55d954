//! Shard fleet builder
//!
//! Captures the shard-agnostic template once, plus the shard total and the
//! range this process is responsible for, then launches a fleet from it. One
//! builder can launch any number of fleets.

use crate::error::FleetError;
use crate::gateway::{ClientFactory, EventListener, Game, Presence, ShardConfig};
use crate::shard::barrier::ReadyBarrier;
use crate::shard::launcher;
use crate::shard::manager::{FleetInner, ShardManager};
use crate::shard::ShardRange;

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use twilight_gateway::Intents;
use twilight_model::gateway::presence::Status;

/// Builder for [`ShardManager`]
#[derive(Debug, Clone)]
pub struct ShardManagerBuilder {
    config: ShardConfig,
    shards_total: u32,
    range: Option<(u32, u32)>,
}

impl ShardManagerBuilder {
    /// Create a builder for a bot with `shards_total` shards
    pub fn new(shards_total: u32) -> Result<Self, FleetError> {
        Self {
            config: ShardConfig::default(),
            shards_total: 1,
            range: None,
        }
        .shard_total(shards_total)
    }

    /// Set the total number of shards. Without an explicit range the fleet
    /// covers `[0, shards_total - 1]`.
    pub fn shard_total(mut self, shards_total: u32) -> Result<Self, FleetError> {
        if shards_total == 0 {
            return Err(FleetError::InvalidArgument(
                "shards total must be positive".to_string(),
            ));
        }
        self.shards_total = shards_total;
        Ok(self)
    }

    /// Restrict the fleet to the inclusive range `lower..=upper`
    pub fn shard_range(mut self, lower: u32, upper: u32) -> Result<Self, FleetError> {
        ShardRange::new(lower, upper, self.shards_total)?;
        self.range = Some((lower, upper));
        Ok(self)
    }

    /// Effective range; fails if the total was lowered below an explicit range
    pub fn range(&self) -> Result<ShardRange, FleetError> {
        match self.range {
            Some((lower, upper)) => ShardRange::new(lower, upper, self.shards_total),
            None => ShardRange::full(self.shards_total),
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn game(mut self, game: Option<Game>) -> Self {
        self.config.presence.game = game;
        self
    }

    pub fn idle(mut self, idle: bool) -> Self {
        self.config.presence.afk = idle;
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.config.presence.status = status;
        self
    }

    pub fn presence(mut self, presence: Presence) -> Self {
        self.config.presence = presence;
        self
    }

    pub fn add_event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.config.listeners.push(listener);
        self
    }

    /// Remove a listener previously added with [`Self::add_event_listener`]
    pub fn remove_event_listener(mut self, listener: &Arc<dyn EventListener>) -> Self {
        self.config
            .listeners
            .retain(|registered| !Arc::ptr_eq(registered, listener));
        self
    }

    pub fn audio_enabled(mut self, enabled: bool) -> Self {
        self.config.audio_enabled = enabled;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn proxy(mut self, proxy_url: Option<String>) -> Self {
        self.config.proxy_url = proxy_url;
        self
    }

    pub fn websocket_timeout(mut self, timeout: Duration) -> Self {
        self.config.websocket_timeout = timeout;
        self
    }

    pub fn large_threshold(mut self, threshold: u64) -> Self {
        self.config.large_threshold = threshold;
        self
    }

    /// Shard template that every shard is built from
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    fn validate(&self) -> Result<ShardRange, FleetError> {
        if self.config.token.trim().is_empty() {
            return Err(FleetError::InvalidArgument(
                "token must not be empty".to_string(),
            ));
        }
        self.range()
    }

    /// Launch the fleet and return once the first shard has been constructed.
    /// The rest of the range launches in the background.
    pub async fn launch_async<F: ClientFactory>(
        &self,
        factory: Arc<F>,
    ) -> Result<ShardManager<F>, FleetError> {
        let range = self.validate()?;
        self.launch(range, factory, self.config.clone(), None).await
    }

    /// Launch the fleet and wait until every shard in the range reported
    /// ready. If the launch aborts or the fleet shuts down meanwhile, the
    /// fleet is shut down and the error returned.
    pub async fn launch_blocking<F: ClientFactory>(
        &self,
        factory: Arc<F>,
    ) -> Result<ShardManager<F>, FleetError> {
        let range = self.validate()?;
        let barrier = Arc::new(ReadyBarrier::new(range));

        let manager = self
            .launch(range, factory, self.config.clone(), Some(Arc::clone(&barrier)))
            .await?;

        info!(target = barrier.target(), "Waiting for shards to become ready");
        if let Err(e) = barrier.wait().await {
            warn!(error = %e, "Shard fleet did not become ready");
            manager.shutdown(true);
            return Err(e);
        }

        Ok(manager)
    }

    async fn launch<F: ClientFactory>(
        &self,
        range: ShardRange,
        factory: Arc<F>,
        config: ShardConfig,
        barrier: Option<Arc<ReadyBarrier>>,
    ) -> Result<ShardManager<F>, FleetError> {
        let inner = Arc::new(FleetInner::new(range, factory, config, barrier));
        launcher::start(&inner).await?;
        Ok(ShardManager { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_is_whole_shard_space() {
        let builder = ShardManagerBuilder::new(8).unwrap();
        assert_eq!(builder.range().unwrap(), ShardRange::full(8).unwrap());
    }

    #[test]
    fn changing_total_moves_default_range() {
        let builder = ShardManagerBuilder::new(8).unwrap().shard_total(16).unwrap();
        assert_eq!(builder.range().unwrap().upper(), 15);
    }

    #[test]
    fn explicit_range_survives_total_change() {
        let builder = ShardManagerBuilder::new(8)
            .unwrap()
            .shard_range(2, 5)
            .unwrap()
            .shard_total(16)
            .unwrap();
        let range = builder.range().unwrap();
        assert_eq!((range.lower(), range.upper(), range.total()), (2, 5, 16));
    }

    #[test]
    fn rejects_zero_total() {
        assert!(matches!(
            ShardManagerBuilder::new(0),
            Err(FleetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_range_outside_total() {
        let builder = ShardManagerBuilder::new(4).unwrap();
        assert!(builder.clone().shard_range(0, 4).is_err());
        assert!(builder.shard_range(3, 2).is_err());
    }

    #[test]
    fn lowering_total_below_range_fails_at_validation() {
        let builder = ShardManagerBuilder::new(8)
            .unwrap()
            .shard_range(4, 7)
            .unwrap()
            .shard_total(4)
            .unwrap()
            .token("token");
        assert!(matches!(builder.validate(), Err(FleetError::InvalidArgument(_))));
    }

    #[test]
    fn empty_token_is_rejected() {
        let builder = ShardManagerBuilder::new(1).unwrap();
        assert!(matches!(builder.validate(), Err(FleetError::InvalidArgument(_))));
    }

    #[test]
    fn template_setters_are_forwarded() {
        let builder = ShardManagerBuilder::new(1)
            .unwrap()
            .token("token")
            .game(Some(Game::playing("chess")))
            .idle(true)
            .status(Status::DoNotDisturb)
            .audio_enabled(true)
            .auto_reconnect(false)
            .proxy(Some("http://proxy:8080".to_string()))
            .websocket_timeout(Duration::from_secs(5));

        let config = builder.config();
        assert_eq!(config.presence.game, Some(Game::playing("chess")));
        assert!(config.presence.afk);
        assert_eq!(config.presence.status, Status::DoNotDisturb);
        assert!(config.audio_enabled);
        assert!(!config.auto_reconnect);
        assert_eq!(config.proxy_url.as_deref(), Some("http://proxy:8080"));
        assert_eq!(config.websocket_timeout, Duration::from_secs(5));
    }

    struct Noop;

    impl EventListener for Noop {
        fn on_event(&self, _event: &crate::gateway::ShardEvent) {}
    }

    #[test]
    fn listeners_are_removed_by_identity() {
        let kept: Arc<dyn EventListener> = Arc::new(Noop);
        let removed: Arc<dyn EventListener> = Arc::new(Noop);

        let builder = ShardManagerBuilder::new(1)
            .unwrap()
            .add_event_listener(Arc::clone(&kept))
            .add_event_listener(Arc::clone(&removed))
            .remove_event_listener(&removed);

        assert_eq!(builder.config().listeners.len(), 1);
        assert!(Arc::ptr_eq(&builder.config().listeners[0], &kept));
    }
}
