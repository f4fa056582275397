//! Rows persisted in the bridge database.
//!
//! These are plain data; the in-memory objects that own them at runtime live
//! in `skylink-core`.

use serde::{Deserialize, Serialize};
use skylink_shared::{EventId, HomeUserId, PortalKey, RemoteId, RoomId};

// ---------------------------------------------------------------------------
// Portal
// ---------------------------------------------------------------------------

/// One remote conversation as seen by one receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalRecord {
    pub key: PortalKey,
    /// Home room, `None` until the room has been created.
    pub mxid: Option<RoomId>,
    pub name: String,
    pub topic: String,
    /// Remote avatar tag (source URL) the current avatar was taken from.
    pub avatar: String,
    /// Home content URI of the uploaded avatar.
    pub avatar_url: String,
    pub encrypted: bool,
}

impl PortalRecord {
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            mxid: None,
            name: String::new(),
            topic: String::new(),
            avatar: String::new(),
            avatar_url: String::new(),
            encrypted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Puppet
// ---------------------------------------------------------------------------

/// A remote contact mirrored as a ghost account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PuppetRecord {
    pub jid: RemoteId,
    pub avatar: String,
    pub avatar_url: String,
    pub displayname: String,
    pub name_quality: i64,
    /// Real home account controlling this puppet (double puppeting).
    pub custom_mxid: Option<HomeUserId>,
    pub access_token: Option<String>,
    pub next_batch: Option<String>,
}

impl PuppetRecord {
    pub fn new(jid: RemoteId) -> Self {
        Self {
            jid,
            avatar: String::new(),
            avatar_url: String::new(),
            displayname: String::new(),
            name_quality: 0,
            custom_mxid: None,
            access_token: None,
            next_batch: None,
        }
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// Remote session material persisted between restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoredSession {
    pub endpoint_id: String,
    pub skype_token: String,
    pub registration_token: String,
    pub registration_token_str: String,
    pub location_host: String,
}

/// Login credentials kept for automatic re-login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredentials {
    pub username: String,
    pub password: String,
}

/// A home account that links a remote login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub mxid: HomeUserId,
    pub jid: Option<RemoteId>,
    pub management_room: Option<RoomId>,
    /// Unix seconds of the last observed activity on the remote connection.
    pub last_connection: i64,
    pub session: Option<StoredSession>,
    pub credentials: Option<StoredCredentials>,
}

impl UserRecord {
    pub fn new(mxid: HomeUserId) -> Self {
        Self {
            mxid,
            jid: None,
            management_room: None,
            last_connection: 0,
            session: None,
            credentials: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A bridged message. Unique per (portal key, client message id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub chat: PortalKey,
    /// Client-assigned message id, the dedup key.
    pub jid: String,
    /// Network-confirmed canonical id; empty until known.
    pub id: String,
    pub mxid: EventId,
    pub sender: RemoteId,
    /// Unix seconds.
    pub timestamp: i64,
    pub content: String,
}

// ---------------------------------------------------------------------------
// User <-> portal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPortalRecord {
    pub user_jid: RemoteId,
    pub portal: PortalKey,
    pub in_community: bool,
}
