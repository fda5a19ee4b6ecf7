//! # seqline-client
//!
//! Client side of seqline: a headless chat core that keeps an ordered,
//! deduplicated local view of each chat, recovers gaps through the pts
//! difference protocol and emits budgeted UI patches.
//!
//! [`Session`](session::Session) is the entry point; it owns the HTTP API
//! client, the realtime socket, the sync loop and the core actor.

pub mod api;
pub mod config;
pub mod core;
pub mod realtime;
pub mod session;
pub mod sync;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber. Respects `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("seqline_client=debug,seqline_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
