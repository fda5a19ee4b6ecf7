//! pts sync endpoints: state, difference, long-poll and ack.
//!
//! Every response carries the sync contract both in the body and in the
//! `x-sync-protocol` / `x-sync-watermark` headers.

use std::collections::HashSet;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use seqline_shared::constants::{
    HEADER_SYNC_PROTOCOL, HEADER_SYNC_WATERMARK, SYNC_DIFFERENCE_DEFAULT_LIMIT,
    SYNC_DIFFERENCE_MAX_LIMIT, SYNC_POLL_DEFAULT_TIMEOUT_MS, SYNC_PROTOCOL_VERSION,
    SYNC_WATERMARK_FIELD,
};
use seqline_shared::protocol::{
    AckRequest, AckResponse, DifferenceRequest, DifferenceResponse, StateResponse, SyncContract,
    SyncState, Update, UpdateKind, UpdatesQuery, UpdatesResponse,
};
use seqline_shared::{Message, MessageId, UserId};

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::error::ServerError;

fn contract_headers() -> [(&'static str, String); 2] {
    [
        (HEADER_SYNC_PROTOCOL, SYNC_PROTOCOL_VERSION.to_string()),
        (HEADER_SYNC_WATERMARK, SYNC_WATERMARK_FIELD.to_string()),
    ]
}

fn sync_state(pts: u64) -> SyncState {
    SyncState {
        pts,
        date: Utc::now().timestamp(),
    }
}

pub async fn get_state(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ServerError> {
    let pts = state.backend.log.current_pts(&user).await?;
    Ok((
        contract_headers(),
        Json(StateResponse {
            contract: SyncContract::current(),
            pts,
            date: Utc::now().timestamp(),
        }),
    ))
}

pub async fn get_difference(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<DifferenceRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let limit = req
        .limit
        .unwrap_or(SYNC_DIFFERENCE_DEFAULT_LIMIT)
        .clamp(1, SYNC_DIFFERENCE_MAX_LIMIT);

    let updates = state.backend.log.updates_after(&user, req.pts, limit).await?;
    // Read after the page so a concurrent append can only make isLatest false.
    let server_pts = state.backend.log.current_pts(&user).await?;
    let pts = updates.last().map(|u| u.update_id).unwrap_or(server_pts);
    let messages = messages_for(&state, &updates).await?;

    debug!(
        user = %user,
        from = req.pts,
        to = pts,
        count = updates.len(),
        "Served sync difference"
    );

    Ok((
        contract_headers(),
        Json(DifferenceResponse {
            contract: SyncContract::current(),
            updates,
            messages,
            state: sync_state(pts),
            is_latest: pts == server_pts,
        }),
    ))
}

pub async fn get_updates(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(q): Query<UpdatesQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let max = state.config.long_poll_max;
    let wait = Duration::from_millis(q.timeout.unwrap_or(SYNC_POLL_DEFAULT_TIMEOUT_MS)).min(max);
    let deadline = Instant::now() + wait;

    // Subscribe before the first query so no append slips through.
    let mut rx = state.notifier.subscribe(&user);
    let (updates, pts) = loop {
        let (updates, pts) = poll_once(&state, &user, q.pts).await?;
        // A client ahead of the log (after a reset or restore) waits like
        // anyone else instead of getting an instant empty answer.
        if !updates.is_empty() || pts > q.pts {
            break (updates, pts);
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            _ => break (updates, pts),
        }
    };

    let messages = messages_for(&state, &updates).await?;
    Ok((
        contract_headers(),
        Json(UpdatesResponse {
            contract: SyncContract::current(),
            updates,
            messages,
            state: sync_state(pts),
        }),
    ))
}

async fn poll_once(
    state: &AppState,
    user: &UserId,
    pts: u64,
) -> Result<(Vec<Update>, u64), ServerError> {
    let updates = state
        .backend
        .log
        .updates_after(user, pts, SYNC_DIFFERENCE_DEFAULT_LIMIT)
        .await?;
    let pts = match updates.last() {
        Some(u) => u.update_id,
        None => state.backend.log.current_pts(user).await?,
    };
    Ok((updates, pts))
}

pub async fn ack(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<AckRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let pts = state.backend.log.record_ack(&user, req.pts).await?;
    Ok((
        contract_headers(),
        Json(AckResponse {
            acknowledged: true,
            pts,
        }),
    ))
}

/// Messages referenced by `message` updates, in update order.
async fn messages_for(state: &AppState, updates: &[Update]) -> Result<Vec<Message>, ServerError> {
    let mut seen = HashSet::new();
    let ids: Vec<MessageId> = updates
        .iter()
        .filter(|u| u.kind == UpdateKind::Message)
        .filter_map(|u| u.message_id)
        .filter(|id| seen.insert(*id))
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(state.backend.chats.messages_by_ids(&ids).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::api::build_router;
    use crate::api::tests::test_state;
    use crate::fanout::tests::private;

    async fn call(app: &AppState, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let resp = build_router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    fn bearer(app: &AppState, user: &str) -> String {
        format!("Bearer {}", app.auth.issue(&UserId::from(user), 60).unwrap())
    }

    fn difference(app: &AppState, user: &str, pts: u64, limit: Option<u32>) -> Request<Body> {
        Request::post("/sync/difference")
            .header("authorization", bearer(app, user))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&DifferenceRequest { pts, limit }).unwrap(),
            ))
            .unwrap()
    }

    async fn wait_for_pts(app: &AppState, user: &str, pts: u64) {
        for _ in 0..100 {
            if app.backend.log.current_pts(&UserId::from(user)).await.unwrap() >= pts {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pts {pts} never reached for {user}");
    }

    #[tokio::test]
    async fn state_carries_contract() {
        let (app, _) = test_state();
        let req = Request::get("/sync/state")
            .header("authorization", bearer(&app, "bob"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[HEADER_SYNC_PROTOCOL], "2");
        assert_eq!(headers[HEADER_SYNC_WATERMARK], "updateId");
        assert_eq!(body["protocolVersion"], 2);
        assert_eq!(body["watermarkField"], "updateId");
        assert_eq!(body["pts"], 0);
    }

    #[tokio::test]
    async fn difference_pages_through_the_log() {
        let (app, _) = test_state();
        for i in 0..3 {
            app.dispatcher
                .send(private("alice", "bob", &format!("m{i}")))
                .await
                .unwrap();
        }
        wait_for_pts(&app, "bob", 3).await;

        let (_, _, body) = call(&app, difference(&app, "bob", 0, Some(2))).await;
        assert_eq!(body["updates"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["state"]["pts"], 2);
        assert_eq!(body["isLatest"], false);

        let (_, _, body) = call(&app, difference(&app, "bob", 2, None)).await;
        assert_eq!(body["updates"][0]["updateId"], 3);
        assert_eq!(body["updates"][0]["type"], "message");
        assert_eq!(body["state"]["pts"], 3);
        assert_eq!(body["isLatest"], true);

        let (_, _, body) = call(&app, difference(&app, "bob", 3, None)).await;
        assert!(body["updates"].as_array().unwrap().is_empty());
        assert_eq!(body["state"]["pts"], 3);
        assert_eq!(body["isLatest"], true);
    }

    #[tokio::test]
    async fn long_poll_wakes_on_new_update() {
        let (app, _) = test_state();
        let poll = Request::get("/sync/updates?pts=0&timeout=5000")
            .header("authorization", bearer(&app, "bob"))
            .body(Body::empty())
            .unwrap();

        let sender = app.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender
                .dispatcher
                .send(private("alice", "bob", "wake"))
                .await
                .unwrap();
        });

        let started = std::time::Instant::now();
        let (status, _, body) = call(&app, poll).await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(body["state"]["pts"], 1);
        assert_eq!(body["messages"][0]["content"], "wake");
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let (app, _) = test_state();
        let poll = Request::get("/sync/updates?pts=0&timeout=30")
            .header("authorization", bearer(&app, "bob"))
            .body(Body::empty())
            .unwrap();
        let (_, _, body) = call(&app, poll).await;
        assert!(body["updates"].as_array().unwrap().is_empty());
        assert_eq!(body["state"]["pts"], 0);
    }

    #[tokio::test]
    async fn long_poll_waits_when_client_is_ahead() {
        let (app, _) = test_state();
        app.dispatcher
            .send(private("alice", "bob", "only"))
            .await
            .unwrap();
        wait_for_pts(&app, "bob", 1).await;

        let poll = Request::get("/sync/updates?pts=7&timeout=200")
            .header("authorization", bearer(&app, "bob"))
            .body(Body::empty())
            .unwrap();
        let started = std::time::Instant::now();
        let (status, _, body) = call(&app, poll).await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(body["updates"].as_array().unwrap().is_empty());
        assert_eq!(body["state"]["pts"], 1);
    }

    #[tokio::test]
    async fn ack_is_monotonic() {
        let (app, _) = test_state();
        let ack = |pts: u64| {
            Request::post("/sync/ack")
                .header("authorization", bearer(&app, "bob"))
                .header("content-type", "application/json")
                .body(Body::from(format!("{{\"pts\":{pts}}}")))
                .unwrap()
        };
        let (_, _, body) = call(&app, ack(5)).await;
        assert_eq!(body["pts"], 5);
        let (_, _, body) = call(&app, ack(2)).await;
        assert_eq!(body["pts"], 5);
        assert_eq!(body["acknowledged"], true);
    }
}
