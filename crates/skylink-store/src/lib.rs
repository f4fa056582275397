//! # skylink-store
//!
//! Durable state of the bridge, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for portals,
//! puppets, users, bridged messages and the user/portal membership relation.
//! Callers in async code share it behind a `tokio::sync::Mutex`; every
//! logical write is a single statement or a single transaction.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod portals;
pub mod puppets;
pub mod user_portals;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
