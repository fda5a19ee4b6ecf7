//! # seqline-server
//!
//! Ordered chat delivery:
//! - **Sequencer** assigning gapless per-chat `seq` values
//! - **Fanout dispatcher** with full fanout for small chats and read-scaling
//!   for large groups, backed by a retrying worker pool
//! - **Per-user update log** exposed through the pts sync API
//!   (`/sync/state`, `/sync/difference`, `/sync/updates`, `/sync/ack`)
//! - **Cursor-paged history** (`/messages/chat/:chat_id`, `/messages/context`)
//! - **Realtime WebSocket transport** (`/ws`) with per-connection batching

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod message_routes;
pub mod notifier;
pub mod queue;
pub mod rate_limit;
pub mod realtime;
pub mod sequencer;
pub mod sync_routes;

pub use api::{build_router, serve, AppState};
pub use config::ServerConfig;
