use skylink_shared::{IdError, RoomId};
use skylink_store::StoreError;
use thiserror::Error;

/// Failures surfaced by the bridge core.
///
/// Pipeline-internal errors never escape a portal consumer; they end up as a
/// log line or an in-room notice. Store errors are the exception and are
/// propagated to whoever drives the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Authentication expired")]
    AuthExpired,

    /// Absorbed by deduplication, never shown to users.
    #[error("Duplicate message")]
    DuplicateMessage,

    #[error("Room {0} was created concurrently")]
    RoomCreateRace(RoomId),

    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    #[error("Failed to download media: {0}")]
    DownloadFailure(String),

    #[error("message sending timed out")]
    SendTimeout,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Not connected to the remote network")]
    NotConnected,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Home server error: {0}")]
    Home(String),

    #[error("Remote network error: {0}")]
    Remote(String),

    #[error("Bridge is shutting down")]
    Shutdown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Identifier error: {0}")]
    Id(IdError),
}

impl From<IdError> for BridgeError {
    fn from(err: IdError) -> Self {
        match err {
            IdError::UnknownMessageType(tag) => BridgeError::UnknownContentType(tag),
            other => BridgeError::Id(other),
        }
    }
}

impl BridgeError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, BridgeError::AuthExpired)
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientNetwork(_) | BridgeError::SendTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
