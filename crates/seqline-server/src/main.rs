use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use seqline_server::config::ServerConfig;
use seqline_server::db::SqliteStore;
use seqline_server::queue::{spawn_fanout_workers, RetryPolicy};
use seqline_server::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,seqline_server=debug")),
        )
        .init();

    info!("Starting seqline server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = SqliteStore::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database ready");

    let http_addr = config.http_addr;
    let workers = config.fanout_workers;
    let (app_state, jobs) = AppState::new(config, store);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let worker_handles = spawn_fanout_workers(
        jobs,
        app_state.dispatcher.executor(),
        workers,
        RetryPolicy::default(),
    );
    info!(workers = worker_handles.len(), "Fanout workers running");

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_rl = app_state.rate_limiter.clone();
    let send_rl = app_state.send_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_rl.purge_stale(600.0).await;
            send_rl.purge_stale(600.0).await;
        }
    });

    // Drop long-poll channels nobody waits on (every minute)
    let notifier = app_state.notifier.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            notifier.purge_idle();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
