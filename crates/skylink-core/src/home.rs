//! Home-protocol side of the bridge: the client the core drives and the
//! events it receives.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skylink_shared::{EventId, HomeUserId, MediaKind, RoomId};

use crate::error::Result;

/// The account an action is performed as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Intent {
    /// The bridge bot.
    Bot,
    /// A puppet ghost account managed by the bridge.
    Ghost(HomeUserId),
    /// A real home account lent to a puppet (double puppeting).
    Custom {
        mxid: HomeUserId,
        access_token: String,
    },
}

impl Intent {
    /// Home user id acting under this intent.
    pub fn user_id(&self, bot: &HomeUserId) -> HomeUserId {
        match self {
            Intent::Bot => bot.clone(),
            Intent::Ghost(mxid) => mxid.clone(),
            Intent::Custom { mxid, .. } => mxid.clone(),
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Intent::Custom { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Text,
    Notice,
    Emote,
    Location,
    Media(MediaKind),
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Text => "m.text",
            MsgType::Notice => "m.notice",
            MsgType::Emote => "m.emote",
            MsgType::Location => "m.location",
            MsgType::Media(kind) => kind.msgtype(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "m.text" => Some(MsgType::Text),
            "m.notice" => Some(MsgType::Notice),
            "m.emote" => Some(MsgType::Emote),
            "m.location" => Some(MsgType::Location),
            other => MediaKind::from_msgtype(other).map(MsgType::Media),
        }
    }
}

/// Relation of a message to an earlier event in the same room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// The message replaces (edits) the target.
    Replace(EventId),
    /// The message replies to the target.
    Reply(EventId),
}

/// Content of a room message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeMessage {
    pub msgtype: MsgType,
    pub body: String,
    /// HTML rendering, when richer than `body`.
    pub formatted_body: Option<String>,
    /// Content URI for media.
    pub url: Option<String>,
    pub mimetype: Option<String>,
    pub size: Option<u64>,
    pub geo_uri: Option<String>,
    pub relates_to: Option<Relation>,
}

impl HomeMessage {
    fn with_type(msgtype: MsgType, body: impl Into<String>) -> Self {
        Self {
            msgtype,
            body: body.into(),
            formatted_body: None,
            url: None,
            mimetype: None,
            size: None,
            geo_uri: None,
            relates_to: None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::with_type(MsgType::Text, body)
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self::with_type(MsgType::Notice, body)
    }

    pub fn media(
        kind: MediaKind,
        body: impl Into<String>,
        url: String,
        mimetype: String,
        size: u64,
    ) -> Self {
        Self {
            url: Some(url),
            mimetype: Some(mimetype),
            size: Some(size),
            ..Self::with_type(MsgType::Media(kind), body)
        }
    }

    pub fn location(body: impl Into<String>, geo_uri: String) -> Self {
        Self {
            geo_uri: Some(geo_uri),
            ..Self::with_type(MsgType::Location, body)
        }
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relates_to = Some(relation);
        self
    }

    pub fn reply_to(&self) -> Option<&EventId> {
        match &self.relates_to {
            Some(Relation::Reply(event)) => Some(event),
            _ => None,
        }
    }
}

/// A state event placed into a room at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

/// `m.room.power_levels` content, restricted to the fields the bridge sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: BTreeMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub invite: i64,
    #[serde(default)]
    pub events: BTreeMap<String, i64>,
}

impl PowerLevels {
    pub fn user_level(&self, user: &HomeUserId) -> i64 {
        self.users.get(user.as_str()).copied().unwrap_or(self.users_default)
    }

    /// Returns whether the level changed.
    pub fn ensure_user_level(&mut self, user: &HomeUserId, level: i64) -> bool {
        if self.user_level(user) == level {
            return false;
        }
        self.users.insert(user.as_str().to_string(), level);
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRoomRequest {
    /// Account that creates the room and becomes its first member.
    pub creator: Intent,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub invite: Vec<HomeUserId>,
    pub is_direct: bool,
    pub power_levels: PowerLevels,
    pub initial_state: Vec<StateEvent>,
}

/// Home-protocol client used by the core.
///
/// Implementations own the wire protocol, end-to-end encryption of rooms
/// flagged as encrypted, and auto-joining a ghost to a room the first time it
/// acts there.
#[async_trait]
pub trait HomeClient: Send + Sync {
    async fn create_room(&self, request: CreateRoomRequest) -> Result<RoomId>;

    async fn invite(&self, intent: &Intent, room: &RoomId, user: &HomeUserId) -> Result<()>;

    async fn ensure_joined(&self, intent: &Intent, room: &RoomId) -> Result<()>;

    async fn kick(
        &self,
        intent: &Intent,
        room: &RoomId,
        user: &HomeUserId,
        reason: &str,
    ) -> Result<()>;

    async fn leave(&self, intent: &Intent, room: &RoomId) -> Result<()>;

    async fn joined_members(&self, room: &RoomId) -> Result<Vec<HomeUserId>>;

    async fn get_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>>;

    async fn set_state(
        &self,
        intent: &Intent,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
        content: Value,
    ) -> Result<EventId>;

    /// Send a message. `timestamp_ms` asks the server to backdate it.
    async fn send_message(
        &self,
        intent: &Intent,
        room: &RoomId,
        message: &HomeMessage,
        timestamp_ms: Option<i64>,
    ) -> Result<EventId>;

    async fn redact(&self, intent: &Intent, room: &RoomId, event: &EventId) -> Result<()>;

    async fn mark_read(&self, intent: &Intent, room: &RoomId, event: &EventId) -> Result<()>;

    async fn set_typing(
        &self,
        intent: &Intent,
        room: &RoomId,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<()>;

    async fn set_presence(&self, intent: &Intent, online: bool) -> Result<()>;

    async fn set_display_name(&self, intent: &Intent, name: &str) -> Result<()>;

    async fn set_avatar_url(&self, intent: &Intent, url: &str) -> Result<()>;

    /// Upload media, returning its content URI.
    async fn upload(&self, data: Bytes, mimetype: &str) -> Result<String>;

    async fn download(&self, url: &str) -> Result<Bytes>;

    /// Obtain a fresh access token for a double-puppeted account.
    async fn login_as(&self, user: &HomeUserId) -> Result<String>;
}

/// A message event received from the home protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct HomeMessageEvent {
    pub event_id: EventId,
    pub room: RoomId,
    pub sender: HomeUserId,
    pub content: HomeMessage,
}

/// Events the home protocol delivers to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum HomeEvent {
    Message(HomeMessageEvent),
    Redaction {
        event_id: EventId,
        room: RoomId,
        sender: HomeUserId,
        redacts: EventId,
    },
    Leave {
        room: RoomId,
        user: HomeUserId,
    },
    Kick {
        room: RoomId,
        sender: HomeUserId,
        target: HomeUserId,
    },
    Invite {
        room: RoomId,
        sender: HomeUserId,
        target: HomeUserId,
    },
}

impl HomeEvent {
    pub fn room(&self) -> &RoomId {
        match self {
            HomeEvent::Message(event) => &event.room,
            HomeEvent::Redaction { room, .. }
            | HomeEvent::Leave { room, .. }
            | HomeEvent::Kick { room, .. }
            | HomeEvent::Invite { room, .. } => room,
        }
    }

    pub fn sender(&self) -> &HomeUserId {
        match self {
            HomeEvent::Message(event) => &event.sender,
            HomeEvent::Leave { user, .. } => user,
            HomeEvent::Redaction { sender, .. }
            | HomeEvent::Kick { sender, .. }
            | HomeEvent::Invite { sender, .. } => sender,
        }
    }
}
