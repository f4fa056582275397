//! # skylink-shared
//!
//! Identifier types, constants and content tagging shared by the store and
//! the bridge core.

pub mod constants;
pub mod content;
pub mod error;
pub mod types;

pub use content::{MediaKind, RemoteMessageKind};
pub use error::IdError;
pub use types::{EventId, HomeUserId, PortalKey, RemoteId, RoomId};
