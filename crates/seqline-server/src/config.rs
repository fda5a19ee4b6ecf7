//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use seqline_shared::constants::{
    DEFAULT_GROUP_FANOUT_THRESHOLD, MIN_GROUP_FANOUT_THRESHOLD, SYNC_POLL_MAX_TIMEOUT_MS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./seqline.db`
    pub database_path: PathBuf,

    /// Groups with more receiving members than this use read-scaling fanout.
    /// Values below 50 are raised to 50.
    /// Env: `GROUP_FANOUT_THRESHOLD`
    /// Default: `500`
    pub group_fanout_threshold: usize,

    /// Number of fanout worker tasks.
    /// Env: `FANOUT_WORKERS`
    /// Default: `4`
    pub fanout_workers: usize,

    /// Capacity of the fanout job channel. A full channel makes senders
    /// deliver inline.
    /// Env: `FANOUT_QUEUE_CAPACITY`
    /// Default: `1024`
    pub fanout_queue_capacity: usize,

    /// HS256 secret for bearer tokens.
    /// Env: `JWT_SECRET`
    /// Default: a fixed development secret.
    pub jwt_secret: String,

    /// Upper bound for `GET /sync/updates` waits.
    /// Env: `LONG_POLL_MAX_MS`
    /// Default: `60000`
    pub long_poll_max: Duration,

    /// Outbound batching window of realtime connections.
    /// Env: `REALTIME_TICK_MS`
    /// Default: `25`
    pub realtime_tick: Duration,

    /// Realtime sends allowed per user per second, and burst size.
    pub send_rate: f64,
    pub send_burst: f64,
}

const DEV_JWT_SECRET: &str = "seqline-dev-secret";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./seqline.db"),
            group_fanout_threshold: DEFAULT_GROUP_FANOUT_THRESHOLD,
            fanout_workers: 4,
            fanout_queue_capacity: 1024,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            long_poll_max: Duration::from_millis(SYNC_POLL_MAX_TIMEOUT_MS),
            realtime_tick: Duration::from_millis(25),
            send_rate: 5.0,
            send_burst: 20.0,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("group_fanout_threshold", &self.group_fanout_threshold)
            .field("fanout_workers", &self.fanout_workers)
            .field("fanout_queue_capacity", &self.fanout_queue_capacity)
            .field("jwt_secret", &"<redacted>")
            .field("long_poll_max", &self.long_poll_max)
            .field("realtime_tick", &self.realtime_tick)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>("HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(n) = parse_var::<usize>("GROUP_FANOUT_THRESHOLD") {
            if n < MIN_GROUP_FANOUT_THRESHOLD {
                tracing::warn!(
                    value = n,
                    min = MIN_GROUP_FANOUT_THRESHOLD,
                    "GROUP_FANOUT_THRESHOLD below minimum, clamping"
                );
            }
            config.group_fanout_threshold = n.max(MIN_GROUP_FANOUT_THRESHOLD);
        }

        if let Some(n) = parse_var::<usize>("FANOUT_WORKERS") {
            config.fanout_workers = n.max(1);
        }

        if let Some(n) = parse_var::<usize>("FANOUT_QUEUE_CAPACITY") {
            config.fanout_queue_capacity = n.max(1);
        }

        match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => tracing::warn!("JWT_SECRET not set, using the development secret"),
        }

        if let Some(ms) = parse_var::<u64>("LONG_POLL_MAX_MS") {
            config.long_poll_max = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>("REALTIME_TICK_MS") {
            config.realtime_tick = Duration::from_millis(ms.max(1));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Read and parse an env var; unparseable values log a warning and yield
/// `None` so the default stays in place.
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
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.group_fanout_threshold, 500);
        assert_eq!(config.long_poll_max, Duration::from_secs(60));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = ServerConfig::default();
        let dbg = format!("{config:?}");
        assert!(!dbg.contains(DEV_JWT_SECRET));
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        std::env::set_var("SEQLINE_TEST_PARSE_VAR", "not-a-number");
        assert_eq!(parse_var::<usize>("SEQLINE_TEST_PARSE_VAR"), None);
        std::env::set_var("SEQLINE_TEST_PARSE_VAR", " 64 ");
        assert_eq!(parse_var::<usize>("SEQLINE_TEST_PARSE_VAR"), Some(64));
        std::env::remove_var("SEQLINE_TEST_PARSE_VAR");
    }
}
