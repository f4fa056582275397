//! # skylink-core
//!
//! Bridges a Skype-style remote chat network onto a Matrix-style home
//! server. The crate owns the in-memory object graph (users, puppets,
//! portals), the per-portal message pipeline, outbound delivery and content
//! conversion. Both networks are reached through the [`HomeClient`] and
//! [`RemoteClient`] traits so the transports stay outside.

pub mod bridge;
pub mod config;
pub mod context;
pub mod converter;
pub mod error;
pub mod home;
pub mod ids;
pub mod logging;
pub mod portal;
pub mod puppet;
pub mod registry;
pub mod remote;
pub mod session;
pub mod sync;
pub mod user;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use context::BridgeContext;
pub use converter::{ContentConverter, SkypeConverter};
pub use error::{BridgeError, Result};
pub use home::{HomeClient, HomeEvent, HomeMessage, Intent};
pub use portal::Portal;
pub use puppet::Puppet;
pub use remote::{RemoteClient, RemoteConnector, RemoteEvent, RemoteMessage};
pub use user::{SessionState, User};
