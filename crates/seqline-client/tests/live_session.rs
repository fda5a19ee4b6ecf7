//! End-to-end against a real server on a loopback port: alice sends over the
//! socket, bob (no socket) picks the message up through the long-poll
//! fallback.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use seqline_client::config::ClientConfig;
use seqline_client::realtime::OutgoingMessage;
use seqline_client::session::Session;
use seqline_server::db::SqliteStore;
use seqline_server::queue::{spawn_fanout_workers, RetryPolicy};
use seqline_server::{build_router, AppState, ServerConfig};
use seqline_shared::{ChatId, Message, UserId};
use seqline_store::Database;

async fn serve() -> (AppState, String) {
    let store = SqliteStore::open_in_memory().unwrap();
    let config = ServerConfig {
        jwt_secret: "client-it".into(),
        ..ServerConfig::default()
    };
    let (state, jobs) = AppState::new(config, store);
    spawn_fanout_workers(jobs, state.dispatcher.executor(), 2, RetryPolicy::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });
    (state, format!("http://{addr}"))
}

fn client_config(base: &str) -> ClientConfig {
    let mut config = ClientConfig {
        api_base: base.to_string(),
        ws_url: ClientConfig::ws_url_for(base),
        patch_tick: Duration::from_millis(5),
        ..ClientConfig::default()
    };
    config.sync.disconnect_grace = Duration::from_millis(50);
    config.sync.poll_timeout = Duration::from_millis(500);
    config
}

async fn wait_for(session: &Session, chat: &ChatId) -> Vec<Message> {
    for _ in 0..100 {
        let held = session.core().snapshot(chat.clone()).await.unwrap();
        if !held.is_empty() {
            return held;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn hello_over_the_socket_and_the_long_poll() {
    let (state, base) = serve().await;
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let chat: ChatId = "p:alice:bob".parse().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("alice.db");
    let token = state.auth.issue(&alice, 300).unwrap();
    let (alice_session, _alice_patches) = Session::start(
        alice.clone(),
        &token,
        client_config(&base),
        Some(Database::open_at(&cache_path).unwrap()),
        true,
    )
    .await
    .unwrap();
    assert!(alice_session.is_realtime());

    let token = state.auth.issue(&bob, 300).unwrap();
    let (bob_session, _bob_patches) =
        Session::start(bob.clone(), &token, client_config(&base), None, false)
            .await
            .unwrap();

    let ack = alice_session
        .send(OutgoingMessage::text(chat.clone(), "hello"))
        .await
        .unwrap();
    assert_eq!(ack.seq, 1);
    assert_eq!(ack.chat_id, chat);

    let held = alice_session.core().snapshot(chat.clone()).await.unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].id, ack.message_id);
    assert_eq!(held[0].seq, Some(1));

    let received = wait_for(&bob_session, &chat).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].content, "hello");
    assert_eq!(received[0].sender_id, alice);
    assert!(bob_session.core().pts().await.unwrap() >= 1);

    alice_session.shutdown().await;
    bob_session.shutdown().await;

    let cache = Database::open_at(&cache_path).unwrap();
    assert_eq!(cache.count_messages(Some(&chat)).unwrap(), 1);
    let stored = cache.load_recent(&chat, 10).unwrap();
    assert_eq!(stored[0].seq, Some(1));
    assert_eq!(stored[0].id, ack.message_id);
}
