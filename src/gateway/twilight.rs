//! Twilight-backed gateway client
//!
//! [`TwilightFactory`] builds one [`twilight_gateway::Shard`] per shard id and
//! drives its event loop on a dedicated task. Status, latency, guilds and
//! users are tracked from gateway events so fleet queries never touch the
//! connection itself.
//!
//! The factory owns the REST client shared by every shard it creates; that
//! client is the process-wide resource released on fleet shutdown.

use crate::error::{ClientError, LaunchError};
use crate::gateway::{
    ApplicationInfo, ClientFactory, Game, GameKind, GatewayClient, GatewayStatus, Guild, Presence,
    ShardConfig, ShardEventKind, ShardId, ShardInfo, User,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use twilight_gateway::{
    CloseFrame, ConfigBuilder, EventTypeFlags, Intents, MessageSender, Shard, StreamExt as _,
};
use twilight_http::error::ErrorType;
use twilight_http::Client as HttpClient;
use twilight_model::gateway::event::Event;
use twilight_model::gateway::payload::incoming::GuildCreate;
use twilight_model::gateway::payload::outgoing::update_presence::{
    UpdatePresence, UpdatePresencePayload,
};
use twilight_model::gateway::presence::{Activity, ActivityType, MinimalActivity};
use twilight_model::gateway::{OpCode, ShardId as GatewayShardId};
use twilight_model::id::marker::{GuildMarker, UserMarker};
use twilight_model::id::Id;

/// Mark shard dead after this many consecutive receive errors without success
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// How long a closing shard may take to flush its close frame
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// `large_threshold` bounds accepted by the gateway
const LARGE_THRESHOLD_RANGE: (u64, u64) = (50, 250);

const NO_LATENCY: u64 = u64::MAX;

/// Builds Twilight shards and owns the shared REST client
#[derive(Default)]
pub struct TwilightFactory {
    http: Mutex<Option<Arc<HttpClient>>>,
    released: AtomicBool,
}

impl TwilightFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared REST client, created on first use
    fn http(&self, token: &str) -> Result<Arc<HttpClient>, LaunchError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LaunchError::InvalidArgument(
                "shared resources have been released".to_string(),
            ));
        }
        let mut http = self.http.lock();
        let client = http.get_or_insert_with(|| Arc::new(HttpClient::new(token.to_string())));
        Ok(Arc::clone(client))
    }
}

/// Map a REST failure during credential validation onto the launch taxonomy
fn classify_http_error(err: twilight_http::Error) -> LaunchError {
    let status = match err.kind() {
        ErrorType::Unauthorized => Some(401),
        ErrorType::Response { status, .. } => Some(status.get()),
        _ => None,
    };

    match status {
        Some(401) => LaunchError::InvalidCredentials,
        Some(429) => LaunchError::RateLimited { retry_after: None },
        _ => LaunchError::Other(Box::new(err)),
    }
}

fn activity(game: &Game) -> Activity {
    let (kind, url) = match &game.kind {
        GameKind::Playing => (ActivityType::Playing, None),
        GameKind::Streaming { url } => (ActivityType::Streaming, Some(url.clone())),
        GameKind::Listening => (ActivityType::Listening, None),
        GameKind::Watching => (ActivityType::Watching, None),
        GameKind::Competing => (ActivityType::Competing, None),
    };

    MinimalActivity {
        kind,
        name: game.name.clone(),
        url,
    }
    .into()
}

fn presence_payload(presence: &Presence) -> UpdatePresencePayload {
    UpdatePresencePayload {
        activities: presence.game.iter().map(activity).collect(),
        afk: presence.afk,
        since: None,
        status: presence.status,
    }
}

#[async_trait]
impl ClientFactory for TwilightFactory {
    type Client = TwilightClient;

    async fn create(
        &self,
        shard: ShardInfo,
        config: &ShardConfig,
    ) -> Result<Arc<TwilightClient>, LaunchError> {
        if config.token.trim().is_empty() {
            return Err(LaunchError::InvalidArgument(
                "token must not be empty".to_string(),
            ));
        }

        let gateway_id = GatewayShardId::new_checked(shard.id, shard.total).ok_or_else(|| {
            LaunchError::InvalidArgument(format!(
                "shard {} is not below shards total {}",
                shard.id, shard.total
            ))
        })?;

        let http = self.http(&config.token)?;
        http.current_user().await.map_err(classify_http_error)?;

        let mut intents = config.intents;
        if config.audio_enabled {
            intents |= Intents::GUILD_VOICE_STATES;
        }

        let (min, max) = LARGE_THRESHOLD_RANGE;
        let mut builder = ConfigBuilder::new(config.token.clone(), intents)
            .presence(presence_payload(&config.presence))
            .large_threshold(config.large_threshold.clamp(min, max));
        if let Some(ref proxy) = config.proxy_url {
            builder = builder.proxy_url(proxy.clone());
        }

        let gateway_shard = Shard::with_config(gateway_id, builder.build());
        let sender = gateway_shard.sender();
        let state = Arc::new(ClientState::new(shard.id));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_shard(
            gateway_shard,
            Arc::clone(&state),
            config.clone(),
            cancel.clone(),
        ));

        debug!(shard_id = shard.id, ?intents, "Twilight shard created");

        Ok(Arc::new(TwilightClient {
            shard_id: shard.id,
            state,
            sender,
            http: Mutex::new(Some(http)),
            cancel,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }))
    }

    fn release_shared_resources(&self) {
        self.released.store(true, Ordering::SeqCst);
        if self.http.lock().take().is_some() {
            info!("Shared REST client released");
        }
    }
}

/// A cached user and the guilds of this shard it was seen in
#[derive(Debug)]
struct Member {
    user: User,
    guilds: HashSet<Id<GuildMarker>>,
}

/// State tracked from one shard's gateway events
#[derive(Debug)]
struct ClientState {
    shard_id: ShardId,
    status: AtomicU8,
    latency_ms: AtomicU64,
    guilds: DashMap<Id<GuildMarker>, Guild>,
    users: DashMap<Id<UserMarker>, Member>,
}

impl ClientState {
    fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            status: AtomicU8::new(GatewayStatus::Connecting.as_u8()),
            latency_ms: AtomicU64::new(NO_LATENCY),
            guilds: DashMap::new(),
            users: DashMap::new(),
        }
    }

    fn status(&self) -> GatewayStatus {
        GatewayStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: GatewayStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Relaxed) {
            NO_LATENCY => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(NO_LATENCY - 1);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    fn insert_guild(&self, id: Id<GuildMarker>, name: Option<String>) {
        match self.guilds.get_mut(&id) {
            // Keep a known name when the guild goes unavailable
            Some(mut entry) => {
                if name.is_some() {
                    entry.name = name;
                }
            }
            None => {
                self.guilds.insert(id, Guild { id, name });
            }
        }
    }

    /// Forget a guild the bot left, and every user only seen through it
    fn remove_guild(&self, guild_id: Id<GuildMarker>) {
        self.guilds.remove(&guild_id);
        self.users.retain(|_, member| {
            member.guilds.remove(&guild_id);
            !member.guilds.is_empty()
        });
    }

    fn insert_member(&self, guild_id: Id<GuildMarker>, user: &twilight_model::user::User) {
        let view = User {
            id: user.id,
            name: user.name.clone(),
            bot: user.bot,
        };
        let mut member = self.users.entry(user.id).or_insert_with(|| Member {
            user: view.clone(),
            guilds: HashSet::new(),
        });
        member.user = view;
        member.guilds.insert(guild_id);
    }

    fn remove_member(&self, guild_id: Id<GuildMarker>, user_id: Id<UserMarker>) {
        self.users.remove_if_mut(&user_id, |_, member| {
            member.guilds.remove(&guild_id);
            member.guilds.is_empty()
        });
    }
}

/// One Twilight shard of the fleet
pub struct TwilightClient {
    shard_id: ShardId,
    state: Arc<ClientState>,
    sender: MessageSender,
    http: Mutex<Option<Arc<HttpClient>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl GatewayClient for TwilightClient {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn status(&self) -> GatewayStatus {
        self.state.status()
    }

    fn ping(&self) -> Option<Duration> {
        self.state.latency()
    }

    fn guilds(&self) -> Vec<Guild> {
        self.state.guilds.iter().map(|e| e.value().clone()).collect()
    }

    fn users(&self) -> Vec<User> {
        self.state.users.iter().map(|e| e.value().user.clone()).collect()
    }

    fn set_presence(&self, presence: &Presence) {
        let command = UpdatePresence {
            d: presence_payload(presence),
            op: OpCode::PresenceUpdate,
        };
        if let Err(e) = self.sender.command(&command) {
            warn!(shard_id = self.shard_id, error = %e, "Failed to send presence update");
        }
    }

    fn shutdown(&self, free: bool) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        self.state.set_status(GatewayStatus::ShuttingDown);
        let sent = self.sender.close(CloseFrame::NORMAL);
        self.cancel.cancel();

        if free {
            self.http.lock().take();
        }

        sent.map_err(|e| ClientError::Send {
            command: "close",
            source: Box::new(e),
        })
    }

    async fn closed(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(shard_id = self.shard_id, error = %e, "Shard task failed while closing");
                }
            }
        }
    }

    async fn application_info(&self) -> Result<ApplicationInfo, ClientError> {
        let http = self.http.lock().clone().ok_or(ClientError::Closed)?;

        let application = http
            .current_user_application()
            .await
            .map_err(|e| ClientError::Http(Box::new(e)))?
            .model()
            .await
            .map_err(|e| ClientError::Http(Box::new(e)))?;

        Ok(ApplicationInfo {
            id: application.id,
            name: application.name,
            description: application.description,
            bot_public: application.bot_public,
        })
    }
}

impl Drop for TwilightClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            if self.state.status() != GatewayStatus::ShuttingDown {
                task.abort();
            }
        }
    }
}

/// Run a single shard's event loop
async fn run_shard(
    mut shard: Shard,
    state: Arc<ClientState>,
    mut config: ShardConfig,
    cancel: CancellationToken,
) {
    let shard_id = state.shard_id;

    state.set_status(GatewayStatus::Connecting);
    info!(shard_id, "Shard starting");

    let mut consecutive_errors: u32 = 0;
    let mut stalled = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(
                config.websocket_timeout,
                shard.next_event(EventTypeFlags::all()),
            ) => next,
        };

        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => {
                if !stalled {
                    stalled = true;
                    state.set_status(GatewayStatus::Disconnected);
                    config.emit(shard_id, ShardEventKind::Disconnected);
                    warn!(
                        shard_id,
                        timeout = ?config.websocket_timeout,
                        "No gateway message within websocket timeout"
                    );
                }
                continue;
            }
        };

        let event = match item {
            Ok(event) => {
                consecutive_errors = 0;
                if stalled {
                    stalled = false;
                    state.set_status(GatewayStatus::Connected);
                }
                event
            }
            Err(source) => {
                consecutive_errors += 1;
                warn!(shard_id, error = %source, consecutive = consecutive_errors, "Error receiving event");

                // Immediate fatal: reconnect failure
                if matches!(source.kind(), twilight_gateway::error::ReceiveMessageErrorType::Reconnect) {
                    state.set_status(GatewayStatus::Dead);
                    config.emit(shard_id, ShardEventKind::Disconnected);
                    error!(shard_id, "Fatal gateway error (reconnect failed)");
                    return;
                }

                // Circuit breaker: too many consecutive errors
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    state.set_status(GatewayStatus::Dead);
                    config.emit(shard_id, ShardEventKind::Disconnected);
                    error!(shard_id, consecutive = consecutive_errors, "Shard dead: consecutive error threshold exceeded");
                    return;
                }

                if !config.auto_reconnect {
                    state.set_status(GatewayStatus::Dead);
                    config.emit(shard_id, ShardEventKind::Disconnected);
                    info!(shard_id, "Auto reconnect disabled, stopping shard");
                    return;
                }

                state.set_status(GatewayStatus::Disconnected);
                continue;
            }
        };

        if matches!(event, Event::GatewayHeartbeatAck) {
            if let Some(latency) = shard.latency().average() {
                state.set_latency(latency);
            }
        }
        handle_event(&state, &mut config, &event);
    }

    if state.status() == GatewayStatus::ShuttingDown {
        // Poll until the close frame is flushed
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
                if matches!(item, Ok(Event::GatewayClose(_))) {
                    break;
                }
            }
        })
        .await;
        config.emit(shard_id, ShardEventKind::Shutdown);
    }

    info!(shard_id, "Shard event stream ended");
}

/// Update tracked state from one gateway event
fn handle_event(state: &ClientState, config: &mut ShardConfig, event: &Event) {
    let shard_id = state.shard_id;

    match event {
        Event::GatewayHello(_) => {
            state.set_status(GatewayStatus::Identifying);
        }
        Event::Ready(ready) => {
            for guild in &ready.guilds {
                state.insert_guild(guild.id, None);
            }
            state.set_status(GatewayStatus::Connected);
            info!(
                shard_id,
                guilds = ready.guilds.len(),
                session_id = %ready.session_id,
                "Shard ready"
            );
            config.emit(shard_id, ShardEventKind::Ready);
        }
        Event::Resumed => {
            state.set_status(GatewayStatus::Connected);
            info!(shard_id, "Shard resumed");
            config.emit(shard_id, ShardEventKind::Resumed);
        }
        Event::GatewayReconnect | Event::GatewayInvalidateSession(_) => {
            state.set_status(GatewayStatus::Resuming);
        }
        Event::GatewayClose(_) => {
            if state.status() != GatewayStatus::ShuttingDown {
                state.set_status(GatewayStatus::Disconnected);
                config.emit(shard_id, ShardEventKind::Disconnected);
            }
        }
        Event::GuildCreate(guild) => match &**guild {
            GuildCreate::Available(guild) => {
                state.insert_guild(guild.id, Some(guild.name.clone()));
                for member in &guild.members {
                    state.insert_member(guild.id, &member.user);
                }
                debug!(shard_id, guild_id = %guild.id, "Guild available");
            }
            GuildCreate::Unavailable(guild) => {
                state.insert_guild(guild.id, None);
            }
        },
        Event::GuildDelete(guild) => {
            // unavailable is Option<bool> in 0.17; an outage keeps the guild
            if guild.unavailable != Some(true) {
                state.remove_guild(guild.id);
            }
            debug!(shard_id, guild_id = %guild.id, "Guild left");
        }
        Event::MemberAdd(member) => {
            state.insert_member(member.guild_id, &member.user);
        }
        Event::MemberRemove(member) => {
            state.remove_member(member.guild_id, member.user.id);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twilight_model::gateway::payload::incoming::GuildDelete;
    use twilight_model::gateway::presence::Status;

    fn config(token: &str) -> ShardConfig {
        ShardConfig {
            token: token.to_string(),
            ..ShardConfig::default()
        }
    }

    #[test]
    fn presence_payload_carries_game_and_status() {
        let presence = Presence {
            game: Some(Game::streaming("speedrun", "https://twitch.tv/arrakis")),
            afk: true,
            status: Status::Idle,
        };

        let payload = presence_payload(&presence);
        assert_eq!(payload.activities.len(), 1);
        assert_eq!(payload.activities[0].kind, ActivityType::Streaming);
        assert_eq!(payload.activities[0].name, "speedrun");
        assert_eq!(
            payload.activities[0].url.as_deref(),
            Some("https://twitch.tv/arrakis")
        );
        assert!(payload.afk);
        assert_eq!(payload.status, Status::Idle);
    }

    #[test]
    fn presence_without_game_has_no_activity() {
        let payload = presence_payload(&Presence::default());
        assert!(payload.activities.is_empty());
        assert_eq!(payload.status, Status::Online);
    }

    #[tokio::test]
    async fn factory_rejects_empty_token() {
        let factory = TwilightFactory::new();
        let result = factory
            .create(ShardInfo { id: 0, total: 1 }, &config("  "))
            .await;
        assert!(matches!(result, Err(LaunchError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn factory_rejects_shard_outside_total() {
        let factory = TwilightFactory::new();
        let result = factory
            .create(ShardInfo { id: 2, total: 2 }, &config("token"))
            .await;
        assert!(matches!(result, Err(LaunchError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn factory_refuses_to_build_after_release() {
        let factory = TwilightFactory::new();
        factory.release_shared_resources();
        let result = factory
            .create(ShardInfo { id: 0, total: 1 }, &config("token"))
            .await;
        assert!(matches!(result, Err(LaunchError::InvalidArgument(_))));
    }

    #[test]
    fn client_state_tracks_latency_and_guild_names() {
        let state = ClientState::new(3);
        assert_eq!(state.latency(), None);
        assert_eq!(state.status(), GatewayStatus::Connecting);

        state.set_latency(Duration::from_millis(42));
        assert_eq!(state.latency(), Some(Duration::from_millis(42)));

        let id = Id::new(7);
        state.insert_guild(id, Some("Arrakis".to_string()));
        state.insert_guild(id, None);
        assert_eq!(state.guilds.len(), 1);
        assert_eq!(state.guilds.get(&id).unwrap().name.as_deref(), Some("Arrakis"));
    }

    fn twilight_user(id: u64, name: &str) -> twilight_model::user::User {
        serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "username": name,
            "discriminator": "0",
            "avatar": null,
        }))
        .unwrap()
    }

    #[test]
    fn leaving_a_guild_forgets_its_users() {
        let state = ClientState::new(0);
        let mut config = ShardConfig::default();
        let (dune, caladan) = (Id::new(7), Id::new(8));

        state.insert_guild(dune, Some("dune".to_string()));
        state.insert_guild(caladan, Some("caladan".to_string()));
        state.insert_member(dune, &twilight_user(1, "paul"));
        state.insert_member(dune, &twilight_user(2, "chani"));
        state.insert_member(caladan, &twilight_user(2, "chani"));

        handle_event(
            &state,
            &mut config,
            &Event::GuildDelete(GuildDelete {
                id: dune,
                unavailable: None,
            }),
        );

        assert_eq!(state.guilds.len(), 1);
        let users: Vec<u64> = state.users.iter().map(|e| e.key().get()).collect();
        assert_eq!(users, vec![2]);
    }

    #[test]
    fn guild_outage_keeps_guild_and_users() {
        let state = ClientState::new(0);
        let mut config = ShardConfig::default();
        let dune = Id::new(7);

        state.insert_guild(dune, Some("dune".to_string()));
        state.insert_member(dune, &twilight_user(1, "paul"));

        handle_event(
            &state,
            &mut config,
            &Event::GuildDelete(GuildDelete {
                id: dune,
                unavailable: Some(true),
            }),
        );

        assert_eq!(state.guilds.len(), 1);
        assert_eq!(state.users.len(), 1);
    }

    #[test]
    fn removed_member_stays_while_seen_in_another_guild() {
        let state = ClientState::new(0);
        let (dune, caladan) = (Id::new(7), Id::new(8));
        let chani = twilight_user(2, "chani");

        state.insert_member(dune, &chani);
        state.insert_member(caladan, &chani);

        state.remove_member(dune, chani.id);
        assert_eq!(state.users.len(), 1);

        state.remove_member(caladan, chani.id);
        assert!(state.users.is_empty());
    }
}
