use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{require_auth, JwtVerifier};
use crate::config::ServerConfig;
use crate::db::{Backend, SqliteStore};
use crate::fanout::FanoutDispatcher;
use crate::notifier::UpdateNotifier;
use crate::queue::{FanoutJob, TokioJobQueue};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::realtime::{handle_socket, RealtimeHub};
use crate::{message_routes, sync_routes};

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub dispatcher: Arc<FanoutDispatcher>,
    pub notifier: UpdateNotifier,
    pub hub: RealtimeHub,
    pub auth: Arc<JwtVerifier>,
    pub rate_limiter: RateLimiter,
    pub send_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire every subsystem on top of `store`. The returned receiver feeds
    /// the fanout workers; see [`crate::queue::spawn_fanout_workers`].
    pub fn new(config: ServerConfig, store: SqliteStore) -> (Self, mpsc::Receiver<FanoutJob>) {
        let backend = Backend::sqlite(store);
        let notifier = UpdateNotifier::new();
        let hub = RealtimeHub::new();
        let (queue, jobs) = TokioJobQueue::new(config.fanout_queue_capacity);

        let dispatcher = Arc::new(FanoutDispatcher::new(
            backend.clone(),
            Arc::new(queue),
            notifier.clone(),
            Arc::new(hub.clone()),
            config.group_fanout_threshold,
        ));

        let state = Self {
            backend,
            dispatcher,
            notifier,
            hub,
            auth: Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())),
            rate_limiter: RateLimiter::default(),
            send_limiter: RateLimiter::new(config.send_rate, config.send_burst),
            config: Arc::new(config),
        };
        (state, jobs)
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any);

    let authed = Router::new()
        .route("/sync/state", get(sync_routes::get_state))
        .route("/sync/difference", post(sync_routes::get_difference))
        .route("/sync/updates", get(sync_routes::get_updates))
        .route("/sync/ack", post(sync_routes::ack))
        .route("/messages/chat/:chat_id", get(message_routes::list_messages))
        .route("/messages/context", get(message_routes::message_context))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .merge(authed)
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count(),
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
