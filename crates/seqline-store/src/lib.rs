//! # seqline-store
//!
//! Durable local cache for the seqline client, backed by SQLite.
//!
//! The cache holds three kinds of records: messages keyed by
//! `(chat_id, seq)`, per-chat metadata (`last_seq`, `last_fetched`,
//! `message_count`) and the per-user sync watermark (`pts`). Row counts are
//! bounded by a [`PrunePolicy`]. The crate exposes a synchronous
//! [`Database`] handle that wraps a `rusqlite::Connection`.

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod prune;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
