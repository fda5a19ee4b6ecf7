//! One WebSocket connection: reader loop, batching writer, and the
//! per-connection state machine.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use seqline_shared::realtime::{ClientEvent, ClientFrame, ServerEvent, ServerFrame};
use seqline_shared::{ChatId, ErrorCode, UserId};

use crate::api::AppState;
use crate::fanout::SendRequest;
use crate::rate_limit::RateKey;
use crate::realtime::hub::{group_room, ConnId};

/// Upper bound of events folded into one `batch` frame.
pub const MAX_BATCH_EVENTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    AwaitingAuth,
    Authenticated { user: UserId },
    Closed,
}

/// Inbound side of a connection. Owns the state machine; everything it
/// wants to say goes through the hub so it is batched with fanout pushes.
pub struct Session {
    conn: ConnId,
    state: ConnState,
    app: AppState,
}

impl Session {
    pub fn new(app: AppState, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let conn = app.hub.register(tx);
        Self {
            conn,
            state: ConnState::AwaitingAuth,
            app,
        }
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    fn reply(&self, event: ServerEvent) {
        self.app.hub.send_to_conn(self.conn, event);
    }

    fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.reply(ServerEvent::Error {
            code,
            message: message.into(),
        });
    }

    /// Handle one text frame. Frames that do not decode never reach the
    /// state machine.
    pub async fn on_text(&mut self, text: &str) {
        match ClientFrame::decode(text) {
            Ok(frame) => self.on_event(frame.event).await,
            Err(e) => {
                debug!(conn = self.conn, error = %e, "Rejected realtime frame");
                self.reply_error(ErrorCode::BadRequest, e.to_string());
            }
        }
    }

    async fn on_event(&mut self, event: ClientEvent) {
        let user = match self.state.clone() {
            ConnState::Closed => return,
            ConnState::AwaitingAuth => {
                match event {
                    ClientEvent::Authenticate { token } => self.authenticate(&token).await,
                    _ => self.reply_error(ErrorCode::NotAuthenticated, "authenticate first"),
                }
                return;
            }
            ConnState::Authenticated { user } => user,
        };

        match event {
            ClientEvent::Authenticate { .. } => {
                self.reply_error(ErrorCode::BadRequest, "already authenticated");
            }
            ClientEvent::SendMessage {
                ack_id,
                receiver_id,
                group_id,
                content,
                kind,
                attachments,
                reply_to,
            } => {
                if !self
                    .app
                    .send_limiter
                    .check(RateKey::User(user.clone()))
                    .await
                {
                    self.reply(nack(ack_id, ErrorCode::RateLimited));
                    return;
                }
                let req = SendRequest {
                    sender_id: user,
                    receiver_id,
                    group_id,
                    content,
                    kind,
                    attachments,
                    reply_to,
                };
                match self.app.dispatcher.send(req).await {
                    Ok(out) => self.reply(ServerEvent::Ack {
                        ack_id,
                        ok: true,
                        message_id: Some(out.message.id),
                        chat_id: Some(out.message.chat_id.clone()),
                        seq: out.message.seq,
                        error: None,
                    }),
                    Err(e) => {
                        debug!(error = %e, "Send rejected");
                        self.reply(nack(ack_id, e.code()));
                    }
                }
            }
            ClientEvent::JoinRoom { room } => {
                match room.strip_prefix("group:").map(|g| ChatId::Group(g.into())) {
                    Some(chat) => match self.app.dispatcher.check_access(&chat, &user).await {
                        Ok(()) => self.app.hub.join_room(self.conn, &room),
                        Err(e) => self.reply_error(e.code(), e.to_string()),
                    },
                    None => self.reply_error(ErrorCode::BadRequest, "unknown room"),
                }
            }
            ClientEvent::LeaveRoom { room } => self.app.hub.leave_room(self.conn, &room),
            ClientEvent::TypingStart { chat_id } => self.typing(&user, chat_id, true).await,
            ClientEvent::TypingStop { chat_id } => self.typing(&user, chat_id, false).await,
            ClientEvent::PresenceSubscribe { user_ids } => {
                for presence in self.app.hub.watch_presence(self.conn, &user_ids) {
                    self.reply(presence);
                }
            }
            ClientEvent::ReadChat { chat_id, seq } => {
                match self.app.dispatcher.mark_read(&user, &chat_id, seq).await {
                    // Group rooms already carry the receipt back to us.
                    Ok(receipt) if !chat_id.is_group() => self.reply(receipt.into()),
                    Ok(_) => {}
                    Err(e) => self.reply_error(e.code(), e.to_string()),
                }
            }
            ClientEvent::Ping => self.reply(ServerEvent::Pong),
        }
    }

    async fn authenticate(&mut self, token: &str) {
        let user = match self.app.auth.verify(token) {
            Ok(user) => user,
            Err(e) => {
                // Stay in AwaitingAuth; the client may retry with a fresh token.
                self.reply(ServerEvent::AuthError {
                    message: e.to_string(),
                });
                return;
            }
        };

        let first = self.app.hub.bind_user(self.conn, &user);
        match self.app.backend.directory.groups_of(&user).await {
            Ok(groups) => {
                for g in &groups {
                    self.app.hub.join_room(self.conn, &group_room(g));
                }
            }
            Err(e) => warn!(user = %user, error = %e, "Failed to load group rooms"),
        }

        self.reply(ServerEvent::Authenticated {
            user_id: user.clone(),
        });
        if first {
            self.app.hub.broadcast_presence(&user);
        }
        info!(conn = self.conn, user = %user, "Realtime connection authenticated");
        self.state = ConnState::Authenticated { user };
    }

    async fn typing(&self, user: &UserId, chat_id: ChatId, is_typing: bool) {
        if let Err(e) = self.app.dispatcher.check_access(&chat_id, user).await {
            self.reply_error(e.code(), e.to_string());
            return;
        }
        let event = ServerEvent::Typing {
            chat_id: chat_id.clone(),
            user_id: user.clone(),
            is_typing,
        };
        match &chat_id {
            ChatId::Group(g) => self
                .app
                .hub
                .push_to_room_except(&group_room(g), Some(user), &event),
            ChatId::Private { .. } => {
                if let Some(peer) = chat_id.peer_of(user) {
                    use crate::fanout::EventSink;
                    self.app.hub.push_to_users(std::slice::from_ref(peer), &event);
                }
            }
        }
    }

    /// Tear down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        if let Some(user) = self.app.hub.unregister(self.conn) {
            self.app.hub.broadcast_presence(&user);
        }
    }
}

fn nack(ack_id: String, code: ErrorCode) -> ServerEvent {
    ServerEvent::Ack {
        ack_id,
        ok: false,
        message_id: None,
        chat_id: None,
        seq: None,
        error: Some(code),
    }
}

pub async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let tick = app.config.realtime_tick;
    let mut session = Session::new(app, tx);

    let conn = session.conn;
    let writer = tokio::spawn(async move {
        while let Some(batch) = next_batch(&mut rx, tick).await {
            let text = match ServerFrame::new(batch).encode() {
                Ok(t) => t,
                Err(e) => {
                    warn!(conn, error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(conn, "Realtime writer ended");
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => session.on_text(&text).await,
            Ok(WsMessage::Binary(_)) => {
                session.reply_error(ErrorCode::BadRequest, "binary frames are not supported")
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn, error = %e, "Realtime socket error");
                break;
            }
        }
    }

    session.close();
    writer.abort();
}

/// Wait for one event, then collect whatever else arrives within `tick`,
/// up to [`MAX_BATCH_EVENTS`]. `None` once the channel is closed and empty.
pub(crate) async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    tick: Duration,
) -> Option<ServerEvent> {
    let first = rx.recv().await?;
    let mut events = vec![first];
    tokio::time::sleep(tick).await;
    while events.len() < MAX_BATCH_EVENTS {
        match rx.try_recv() {
            Ok(ev) => events.push(ev),
            Err(_) => break,
        }
    }
    if events.len() == 1 {
        events.pop()
    } else {
        Some(ServerEvent::Batch { events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_state;
    use crate::fanout::tests::seed_group;

    fn frame(event: ClientEvent) -> String {
        ClientFrame::new(event).encode().unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn events_before_auth_are_refused() {
        let (app, _store) = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Session::new(app, tx);

        s.on_text(&frame(ClientEvent::Ping)).await;
        s.on_text("{not json").await;
        let out = drain(&mut rx);
        assert!(matches!(
            out[0],
            ServerEvent::Error {
                code: ErrorCode::NotAuthenticated,
                ..
            }
        ));
        assert!(matches!(
            out[1],
            ServerEvent::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
        assert_eq!(s.state(), &ConnState::AwaitingAuth);
    }

    #[tokio::test]
    async fn bad_token_keeps_awaiting_auth() {
        let (app, _store) = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Session::new(app, tx);
        s.on_text(&frame(ClientEvent::Authenticate {
            token: "garbage".into(),
        }))
        .await;
        assert!(matches!(drain(&mut rx)[0], ServerEvent::AuthError { .. }));
        assert_eq!(s.state(), &ConnState::AwaitingAuth);
    }

    #[tokio::test]
    async fn authenticated_send_is_acked_and_pushed() {
        let (app, _store) = test_state();
        let alice_token = app.auth.issue(&UserId::from("alice"), 60).unwrap();
        let bob_token = app.auth.issue(&UserId::from("bob"), 60).unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut alice = Session::new(app.clone(), tx_a);
        let mut bob = Session::new(app.clone(), tx_b);
        alice
            .on_text(&frame(ClientEvent::Authenticate { token: alice_token }))
            .await;
        bob.on_text(&frame(ClientEvent::Authenticate { token: bob_token }))
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        alice
            .on_text(&frame(ClientEvent::SendMessage {
                ack_id: "a1".into(),
                receiver_id: Some(UserId::from("bob")),
                group_id: None,
                content: "hello".into(),
                kind: Default::default(),
                attachments: vec![],
                reply_to: None,
            }))
            .await;

        let acks = drain(&mut rx_a);
        assert!(acks.iter().any(|e| matches!(
            e,
            ServerEvent::Ack { ack_id, ok: true, seq: Some(1), .. } if ack_id == "a1"
        )));

        // Fanout may run on a worker; give it a moment.
        let mut got = Vec::new();
        for _ in 0..50 {
            got.extend(drain(&mut rx_b));
            if !got.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(&got[0], ServerEvent::Message { message } if message.content == "hello"));

        alice.close();
        bob.close();
        assert_eq!(app.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn group_members_auto_join_and_see_typing() {
        let (app, store) = test_state();
        seed_group(&store, "team", &["alice", "bob"]).await;
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut alice = Session::new(app.clone(), tx_a);
        let mut bob = Session::new(app.clone(), tx_b);
        for (s, who) in [(&mut alice, "alice"), (&mut bob, "bob")] {
            let token = app.auth.issue(&UserId::from(who), 60).unwrap();
            s.on_text(&frame(ClientEvent::Authenticate { token })).await;
        }
        drain(&mut rx_b);

        alice
            .on_text(&frame(ClientEvent::TypingStart {
                chat_id: "g:team".parse().unwrap(),
            }))
            .await;
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerEvent::Typing { is_typing: true, .. }]
        ));
    }

    #[tokio::test]
    async fn batches_collect_events_within_a_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ServerEvent::Pong).unwrap();
        assert_eq!(
            next_batch(&mut rx, Duration::from_millis(1)).await,
            Some(ServerEvent::Pong)
        );

        for _ in 0..(MAX_BATCH_EVENTS + 3) {
            tx.send(ServerEvent::Pong).unwrap();
        }
        match next_batch(&mut rx, Duration::from_millis(1)).await {
            Some(ServerEvent::Batch { events }) => assert_eq!(events.len(), MAX_BATCH_EVENTS),
            other => panic!("unexpected {other:?}"),
        }
        drop(tx);
        assert!(next_batch(&mut rx, Duration::from_millis(1)).await.is_some());
        assert!(next_batch(&mut rx, Duration::from_millis(1)).await.is_none());
    }
}
