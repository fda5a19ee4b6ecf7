//! Client configuration.
//!
//! Defaults work against a local server. Each field can be overridden from
//! the environment; the CLI layers its own flags on top.

use std::str::FromStr;
use std::time::Duration;

use seqline_shared::constants::SEND_ACK_TIMEOUT_MS;

use crate::core::merge::MergeStrategyKind;
use crate::sync::SyncConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the HTTP API.
    /// Env: `SEQLINE_API_BASE`
    /// Default: `http://127.0.0.1:8080`
    pub api_base: String,

    /// Realtime WebSocket endpoint.
    /// Env: `SEQLINE_WS_URL`
    /// Default: `ws://127.0.0.1:8080/ws`
    pub ws_url: String,

    /// Chats kept in memory before the least recently used one is evicted.
    /// Env: `SEQLINE_CHAT_CACHE_LIMIT`
    /// Default: `30`
    pub chat_cache_limit: usize,

    /// Messages kept per chat in memory.
    /// Env: `SEQLINE_MAX_CHAT_MESSAGES`
    /// Default: `10000`
    pub max_chat_messages: usize,

    /// Messages hydrated from the durable cache when a chat opens.
    pub recent_limit: u32,

    /// Page size for history requests.
    pub page_limit: u32,

    /// Env: `SEQLINE_MERGE_STRATEGY` (`two-pointer` | `sort-dedup`)
    pub merge_strategy: MergeStrategyKind,

    /// Patch dispatch interval.
    /// Env: `SEQLINE_PATCH_TICK_MS`
    /// Default: `16`
    pub patch_tick: Duration,

    pub prefetch_max_in_flight: usize,
    pub prefetch_cooldown: Duration,

    /// How long a realtime send waits for its ack.
    pub send_ack_timeout: Duration,

    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8080".to_string(),
            ws_url: "ws://127.0.0.1:8080/ws".to_string(),
            chat_cache_limit: 30,
            max_chat_messages: 10_000,
            recent_limit: 50,
            page_limit: 50,
            merge_strategy: MergeStrategyKind::default(),
            patch_tick: Duration::from_millis(16),
            prefetch_max_in_flight: 2,
            prefetch_cooldown: Duration::from_secs(25),
            send_ack_timeout: Duration::from_millis(SEND_ACK_TIMEOUT_MS),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base) = std::env::var("SEQLINE_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("SEQLINE_WS_URL") {
            config.ws_url = url;
        }
        if let Some(n) = parse_var::<usize>("SEQLINE_CHAT_CACHE_LIMIT") {
            config.chat_cache_limit = n.max(1);
        }
        if let Some(n) = parse_var::<usize>("SEQLINE_MAX_CHAT_MESSAGES") {
            config.max_chat_messages = n.max(1);
        }
        if let Some(kind) = parse_var::<MergeStrategyKind>("SEQLINE_MERGE_STRATEGY") {
            config.merge_strategy = kind;
        }
        if let Some(ms) = parse_var::<u64>("SEQLINE_PATCH_TICK_MS") {
            config.patch_tick = Duration::from_millis(ms.max(1));
        }

        config
    }

    /// Derive the WebSocket URL from an HTTP base (`http` → `ws`, `https` → `wss`).
    pub fn ws_url_for(api_base: &str) -> String {
        let base = api_base.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}/ws")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}/ws")
        } else {
            format!("{base}/ws")
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_core_limits() {
        let config = ClientConfig::default();
        assert_eq!(config.chat_cache_limit, 30);
        assert_eq!(config.max_chat_messages, 10_000);
        assert_eq!(config.send_ack_timeout, Duration::from_secs(10));
        assert_eq!(config.merge_strategy, MergeStrategyKind::TwoPointer);
    }

    #[test]
    fn ws_url_follows_scheme() {
        assert_eq!(
            ClientConfig::ws_url_for("https://chat.example/"),
            "wss://chat.example/ws"
        );
        assert_eq!(
            ClientConfig::ws_url_for("http://127.0.0.1:9000"),
            "ws://127.0.0.1:9000/ws"
        );
    }
}
