//! Fleet-level views of remote entities

use serde::Serialize;
use twilight_model::gateway::presence::Status;
use twilight_model::id::marker::{ApplicationMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;

/// Guild visible to a shard. Each guild is owned by exactly one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guild {
    pub id: Id<GuildMarker>,
    /// `None` while the guild is still unavailable
    pub name: Option<String>,
}

/// User visible to a shard; the same user may be seen by several shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: Id<UserMarker>,
    pub name: String,
    pub bot: bool,
}

/// Application metadata, served by shard 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationInfo {
    pub id: Id<ApplicationMarker>,
    pub name: String,
    pub description: String,
    pub bot_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameKind {
    Playing,
    Streaming { url: String },
    Listening,
    Watching,
    Competing,
}

/// Activity shown in the bot's presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Game {
    pub name: String,
    pub kind: GameKind,
}

impl Game {
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: GameKind::Playing,
        }
    }

    pub fn streaming(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: GameKind::Streaming { url: url.into() },
        }
    }
}

/// Presence broadcast to every shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub game: Option<Game>,
    pub afk: bool,
    pub status: Status,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            game: None,
            afk: false,
            status: Status::Online,
        }
    }
}
