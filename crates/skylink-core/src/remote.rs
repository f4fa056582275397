//! Remote-network side of the bridge: one client per connected user and the
//! events it pushes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use skylink_shared::{HomeUserId, MediaKind, RemoteId, RemoteMessageKind};
use skylink_store::StoredSession;
use tokio::sync::mpsc;

use crate::error::Result;

/// Media attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMedia {
    pub url: String,
    pub file_name: String,
    pub mimetype: String,
}

/// A message as delivered by the remote network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Network-assigned id, may be empty until confirmed.
    pub id: String,
    /// Client-assigned id.
    pub client_message_id: String,
    /// Conversation the message belongs to.
    pub conversation: String,
    /// Empty when the network did not say.
    pub sender: RemoteId,
    pub from_me: bool,
    /// Unix seconds.
    pub timestamp: i64,
    /// Raw type tag, e.g. `RichText`.
    pub message_type: String,
    pub content: String,
    /// Id of the message this one edits or revokes.
    pub edited_id: Option<String>,
    pub media: Option<RemoteMedia>,
}

impl RemoteMessage {
    /// Kind of this message. An empty text message without a client id that
    /// references another message revokes it.
    pub fn kind(&self) -> Result<RemoteMessageKind> {
        let kind = RemoteMessageKind::parse(&self.message_type)?;
        if kind == RemoteMessageKind::Text && self.revoked_id().is_some() {
            return Ok(RemoteMessageKind::Revoke);
        }
        Ok(kind)
    }

    /// Id of the message this one revokes.
    pub fn revoked_id(&self) -> Option<&str> {
        if !self.client_message_id.is_empty() || !self.content.is_empty() {
            return None;
        }
        self.edited_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdateKind {
    Topic(String),
    Picture(String),
    MembersAdded(Vec<RemoteId>),
    MembersRemoved(Vec<RemoteId>),
    ThreadDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUpdate {
    pub conversation: String,
    pub initiator: RemoteId,
    pub kind: ChatUpdateKind,
}

/// Everything a remote connection pushes to its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Message(RemoteMessage),
    Typing {
        conversation: String,
        sender: RemoteId,
        typing: bool,
    },
    Presence {
        sender: RemoteId,
        online: bool,
    },
    ChatUpdate(ChatUpdate),
    ContactAvatar {
        contact: RemoteId,
        url: String,
    },
}

/// Producer half of a user's event queue, handed to the remote client.
///
/// A full queue drops the event with a warning instead of blocking the
/// network reader.
#[derive(Debug, Clone)]
pub struct EventSink {
    user: HomeUserId,
    tx: mpsc::Sender<RemoteEvent>,
}

impl EventSink {
    pub fn new(user: HomeUserId, tx: mpsc::Sender<RemoteEvent>) -> Self {
        Self { user, tx }
    }

    /// Returns `false` when the event was dropped.
    pub fn put(&self, event: RemoteEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(user = %self.user, "Event queue is full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(user = %self.user, "Event queue closed, dropping event");
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub own_id: RemoteId,
    pub session: StoredSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContact {
    pub id: RemoteId,
    pub display_name: Option<String>,
    pub person_id: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConversation {
    pub id: String,
    /// Unix seconds of the last message, if any.
    pub last_message_ts: Option<i64>,
    /// The user has left this conversation.
    pub left: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Member,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupParticipant {
    pub id: RemoteId,
    pub role: GroupRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub jid: String,
    pub name: String,
    pub topic: String,
    pub avatar_url: Option<String>,
    pub participants: Vec<GroupParticipant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundContent {
    Text(String),
    Media {
        kind: MediaKind,
        file_name: String,
        mimetype: String,
        data: Bytes,
    },
}

/// A send request towards the remote network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub conversation: String,
    pub client_message_id: String,
    pub content: OutboundContent,
}

/// One authenticated (or authenticating) remote connection.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn login(&self, credentials: &LoginCredentials) -> Result<RemoteSession>;

    /// Resume a persisted session without credentials.
    async fn restore(&self, session: &StoredSession) -> Result<RemoteSession>;

    /// Start pushing events into `sink`.
    async fn subscribe(&self, sink: EventSink) -> Result<()>;

    /// The single-slot refresh signal of this connection, taken once.
    ///
    /// Positive values mean the session was renewed, anything else means it
    /// expired. Closing the channel ends the refresh watcher.
    fn refresh_signals(&self) -> Option<mpsc::Receiver<i32>>;

    /// Session material as of now, for persisting after a renewal.
    fn current_session(&self) -> Option<StoredSession>;

    async fn contacts(&self) -> Result<Vec<RemoteContact>>;

    async fn conversations(&self) -> Result<Vec<RemoteConversation>>;

    async fn group_info(&self, conversation: &str) -> Result<GroupInfo>;

    /// Messages newer than `since` (unix seconds), at most `limit` of the most recent.
    async fn history(
        &self,
        conversation: &str,
        since: i64,
        limit: Option<usize>,
    ) -> Result<Vec<RemoteMessage>>;

    async fn send_message(&self, message: &OutboundMessage) -> Result<()>;

    /// Best-effort probe whether a message reached the network.
    async fn message_exists(&self, conversation: &str, client_message_id: &str) -> Result<bool>;

    async fn delete_message(&self, conversation: &str, message_id: &str) -> Result<()>;

    async fn add_members(&self, group: &str, members: &[RemoteId]) -> Result<()>;

    async fn remove_members(&self, group: &str, members: &[RemoteId]) -> Result<()>;

    async fn leave_group(&self, group: &str) -> Result<()>;

    async fn download_media(&self, media: &RemoteMedia) -> Result<Bytes>;

    /// Renew the authentication token after an `AuthExpired` failure.
    async fn refresh_token(&self) -> Result<()>;

    async fn logout(&self) -> Result<()>;
}

/// Opens remote connections on behalf of users.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, user: &HomeUserId) -> Result<Arc<dyn RemoteClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence() -> RemoteEvent {
        RemoteEvent::Presence {
            sender: RemoteId::from("8:bob@s.skype.net"),
            online: true,
        }
    }

    #[test]
    fn empty_text_with_reference_is_a_revoke() {
        let mut message = RemoteMessage {
            id: "m2".to_string(),
            client_message_id: String::new(),
            conversation: "19:weekend@thread.skype".to_string(),
            sender: RemoteId::from("8:bob@s.skype.net"),
            from_me: false,
            timestamp: 0,
            message_type: "RichText".to_string(),
            content: String::new(),
            edited_id: Some("m1".to_string()),
            media: None,
        };
        assert_eq!(message.kind().unwrap(), RemoteMessageKind::Revoke);
        assert_eq!(message.revoked_id(), Some("m1"));

        message.content = "fixed typo".to_string();
        assert_eq!(message.kind().unwrap(), RemoteMessageKind::Text);
        assert_eq!(message.revoked_id(), None);

        message.message_type = "RichText/Location".to_string();
        message.content = String::new();
        assert_eq!(message.kind().unwrap(), RemoteMessageKind::Location);
    }

    #[tokio::test]
    async fn sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(HomeUserId::from("@alice:example.org"), tx);

        assert!(sink.put(presence()));
        assert!(!sink.put(presence()));

        assert_eq!(rx.recv().await, Some(presence()));
        assert!(sink.put(presence()));

        drop(rx);
        assert!(!sink.put(presence()));
    }
}
