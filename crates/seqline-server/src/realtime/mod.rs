//! Realtime WebSocket transport.

pub mod connection;
pub mod hub;

pub use connection::handle_socket;
pub use hub::{group_room, ConnId, RealtimeHub};
