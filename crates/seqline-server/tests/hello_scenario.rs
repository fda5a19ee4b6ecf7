//! End-to-end: a private "hello" travels through the sequencer, the worker
//! pool and the update log, and is picked up through the sync API.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use seqline_server::db::{
    ChatStore, GroupMember, GroupRecord, MemberStatus, SqliteStore, UpdateLog,
};
use seqline_server::fanout::{FanoutMode, SendRequest};
use seqline_server::queue::{spawn_fanout_workers, RetryPolicy};
use seqline_server::{build_router, AppState, ServerConfig};
use seqline_shared::{ChatId, GroupId, MessageKind, UserId};

fn start(dir: &tempfile::TempDir, threshold: usize) -> AppState {
    let store = SqliteStore::open(&dir.path().join("server.db")).unwrap();
    let config = ServerConfig {
        jwt_secret: "it-secret".into(),
        group_fanout_threshold: threshold,
        ..ServerConfig::default()
    };
    let (state, jobs) = AppState::new(config, store);
    spawn_fanout_workers(jobs, state.dispatcher.executor(), 2, RetryPolicy::default());
    state
}

fn send(from: &str, receiver: Option<&str>, group: Option<&str>, text: &str) -> SendRequest {
    SendRequest {
        sender_id: UserId::from(from),
        receiver_id: receiver.map(UserId::from),
        group_id: group.map(GroupId::from),
        content: text.into(),
        kind: MessageKind::Text,
        attachments: vec![],
        reply_to: None,
    }
}

async fn delivered(state: &AppState, chat: &ChatId, user: &str) -> (u64, u64) {
    let s = state
        .backend
        .chats
        .member_state(chat, &UserId::from(user))
        .await
        .unwrap()
        .unwrap_or_default();
    (s.last_delivered_seq, s.last_read_seq)
}

#[tokio::test]
async fn hello_reaches_bob() {
    let dir = tempfile::tempdir().unwrap();
    let state = start(&dir, 500);

    let out = state
        .dispatcher
        .send(send("alice", Some("bob"), None, "hello"))
        .await
        .unwrap();
    assert_eq!(out.message.seq, Some(1));
    let chat = out.message.chat_id.clone();
    assert_eq!(chat.to_string(), "p:alice:bob");

    let mut bob_state = (0, 0);
    for _ in 0..100 {
        bob_state = delivered(&state, &chat, "bob").await;
        if bob_state.0 == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bob_state, (1, 0));
    assert_eq!(delivered(&state, &chat, "alice").await, (1, 1));

    let token = state.auth.issue(&UserId::from("bob"), 60).unwrap();
    let req = Request::post("/sync/difference")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"pts":0}"#))
        .unwrap();
    let resp = build_router(state.clone()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["protocolVersion"], 2);
    assert_eq!(body["updates"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["content"], "hello");
    assert_eq!(body["messages"][0]["seq"], 1);
    assert_eq!(body["state"]["pts"], 1);
    assert_eq!(body["isLatest"], true);
}

#[tokio::test]
async fn fanout_mode_switches_above_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let state = start(&dir, 50);
    let store = SqliteStore::open(&dir.path().join("server.db")).unwrap();

    for (group, size) in [("fifty", 50), ("fiftyone", 51)] {
        store
            .upsert_group(&GroupRecord {
                id: GroupId::from(group),
                name: group.into(),
                is_active: true,
            })
            .await
            .unwrap();
        for i in 0..size {
            store
                .upsert_member(&GroupMember {
                    group_id: GroupId::from(group),
                    user_id: UserId::new(format!("u{i}")),
                    status: MemberStatus::Active,
                    role: "member".into(),
                    muted_until: None,
                })
                .await
                .unwrap();
        }
    }

    let full = state
        .dispatcher
        .send(send("u0", None, Some("fifty"), "hi"))
        .await
        .unwrap();
    assert_eq!(full.mode, FanoutMode::Full);
    assert_eq!(full.fanout_recipients, 49);

    let scaled = state
        .dispatcher
        .send(send("u0", None, Some("fiftyone"), "hi"))
        .await
        .unwrap();
    assert_eq!(scaled.mode, FanoutMode::ReadScaling);
    assert_eq!(scaled.fanout_recipients, 0);
    assert_eq!(
        state
            .backend
            .log
            .current_pts(&UserId::from("u50"))
            .await
            .unwrap(),
        0
    );
}
