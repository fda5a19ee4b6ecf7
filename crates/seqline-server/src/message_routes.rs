//! Cursor-paged message history.
//!
//! Pages are always returned in ascending seq order and echo the canonical
//! chat id and cursor protocol so clients can verify them before merging.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};

use seqline_shared::constants::{
    CURSOR_PROTOCOL_VERSION, MESSAGE_CONTEXT_DEFAULT_LIMIT, MESSAGE_PAGE_DEFAULT_LIMIT,
    MESSAGE_PAGE_MAX_LIMIT,
};
use seqline_shared::protocol::{ContextPage, ContextQuery, MessagePage, PageMode, PageQuery, Paging};
use seqline_shared::{ChatId, Message, MessageStatus, UserId};

use crate::api::AppState;
use crate::auth::AuthUser;
use crate::error::ServerError;

fn parse_chat(raw: &str) -> Result<ChatId, ServerError> {
    raw.parse()
        .map_err(|e| ServerError::BadRequest(format!("chatId: {e}")))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(raw_chat): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<Json<MessagePage>, ServerError> {
    let chat = parse_chat(&raw_chat)?;
    let mode = match (q.before_seq, q.after_seq) {
        (Some(_), Some(_)) => {
            return Err(ServerError::BadRequest(
                "beforeSeq and afterSeq are mutually exclusive".into(),
            ))
        }
        (Some(0), None) | (None, Some(0)) => {
            return Err(ServerError::BadRequest("cursor must be positive".into()))
        }
        (Some(_), None) => PageMode::Before,
        (None, Some(_)) => PageMode::After,
        (None, None) => PageMode::Latest,
    };
    state.dispatcher.check_access(&chat, &user).await?;

    let limit = q
        .limit
        .unwrap_or(MESSAGE_PAGE_DEFAULT_LIMIT)
        .clamp(1, MESSAGE_PAGE_MAX_LIMIT);
    let chats = &state.backend.chats;

    let mut messages = match mode {
        PageMode::After => {
            let after = q.after_seq.unwrap_or_default();
            chats.messages_from(&chat, after + 1, limit + 1).await?
        }
        PageMode::Before | PageMode::Latest => {
            chats.messages_before(&chat, q.before_seq, limit + 1).await?
        }
    };
    let has_more = messages.len() > limit as usize;
    messages.truncate(limit as usize);
    if mode != PageMode::After {
        messages.reverse();
    }
    decorate(&state, &chat, &user, &mut messages).await?;

    let latest_seq = state.dispatcher.sequencer().latest_seq(&chat).await?;
    let paging = Paging {
        has_more,
        next_before_seq: messages.first().and_then(Message::seq),
        next_after_seq: messages.last().and_then(Message::seq),
        latest_seq,
        mode,
        limit,
    };

    Ok(Json(MessagePage {
        chat_id: chat.to_string(),
        cursor_protocol: CURSOR_PROTOCOL_VERSION,
        messages,
        paging,
    }))
}

pub async fn message_context(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(q): Query<ContextQuery>,
) -> Result<Json<ContextPage>, ServerError> {
    let chat = parse_chat(&q.chat_id)?;
    if q.seq == 0 {
        return Err(ServerError::BadRequest("seq must be positive".into()));
    }
    state.dispatcher.check_access(&chat, &user).await?;

    let limit = q
        .limit
        .unwrap_or(MESSAGE_CONTEXT_DEFAULT_LIMIT)
        .clamp(1, MESSAGE_PAGE_MAX_LIMIT);
    let half = limit / 2;
    let tail = limit - half;
    let chats = &state.backend.chats;

    let mut older = chats.messages_before(&chat, Some(q.seq), half + 1).await?;
    let has_more_before = older.len() > half as usize;
    older.truncate(half as usize);
    older.reverse();

    let mut newer = chats.messages_from(&chat, q.seq, tail + 1).await?;
    let has_more_after = newer.len() > tail as usize;
    newer.truncate(tail as usize);

    let mut messages = older;
    messages.append(&mut newer);
    decorate(&state, &chat, &user, &mut messages).await?;

    Ok(Json(ContextPage {
        chat_id: chat.to_string(),
        seq: q.seq,
        messages,
        has_more_before,
        has_more_after,
    }))
}

/// Fill in delivery status and read counts of the viewer's own messages.
async fn decorate(
    state: &AppState,
    chat: &ChatId,
    viewer: &UserId,
    messages: &mut [Message],
) -> Result<(), ServerError> {
    let chats = &state.backend.chats;
    match chat.peer_of(viewer) {
        Some(peer) => {
            let peer_state = chats.member_state(chat, peer).await?.unwrap_or_default();
            for m in messages.iter_mut().filter(|m| &m.sender_id == viewer) {
                let seq = m.seq().unwrap_or_default();
                if peer_state.last_read_seq >= seq {
                    m.status = MessageStatus::Read;
                    m.read_count = 1;
                } else if peer_state.last_delivered_seq >= seq {
                    m.status = MessageStatus::Delivered;
                }
            }
        }
        None if chat.is_group() => {
            for m in messages.iter_mut().filter(|m| &m.sender_id == viewer) {
                let seq = m.seq().unwrap_or_default();
                m.read_count = chats.count_readers(chat, seq, viewer).await?;
                if m.read_count > 0 {
                    m.status = MessageStatus::Read;
                }
            }
        }
        None => {}
    }
    Ok(())
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

    async fn get(app: &AppState, user: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let token = app.auth.issue(&UserId::from(user), 60).unwrap();
        let req = Request::get(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let resp = build_router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    fn seqs(body: &serde_json::Value) -> Vec<u64> {
        body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["seq"].as_u64().unwrap())
            .collect()
    }

    async fn seeded(n: usize) -> AppState {
        let (app, _) = test_state();
        for i in 0..n {
            app.dispatcher
                .send(private("alice", "bob", &format!("m{i}")))
                .await
                .unwrap();
        }
        app
    }

    #[tokio::test]
    async fn latest_before_and_after_pages() {
        let app = seeded(7).await;
        let base = "/messages/chat/p:bob:alice";

        let (status, body) = get(&app, "alice", &format!("{base}?limit=3")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chatId"], "p:alice:bob");
        assert_eq!(body["cursorProtocol"], 1);
        assert_eq!(seqs(&body), vec![5, 6, 7]);
        assert_eq!(body["paging"]["hasMore"], true);
        assert_eq!(body["paging"]["nextBeforeSeq"], 5);
        assert_eq!(body["paging"]["latestSeq"], 7);
        assert_eq!(body["paging"]["mode"], "latest");

        let (_, body) = get(&app, "bob", &format!("{base}?beforeSeq=5&limit=10")).await;
        assert_eq!(seqs(&body), vec![1, 2, 3, 4]);
        assert_eq!(body["paging"]["hasMore"], false);

        let (_, body) = get(&app, "bob", &format!("{base}?afterSeq=4&limit=2")).await;
        assert_eq!(seqs(&body), vec![5, 6]);
        assert_eq!(body["paging"]["hasMore"], true);
        assert_eq!(body["paging"]["nextAfterSeq"], 6);
    }

    #[tokio::test]
    async fn bad_cursors_and_outsiders_are_rejected() {
        let app = seeded(1).await;
        let base = "/messages/chat/p:alice:bob";

        let (status, _) = get(&app, "bob", &format!("{base}?beforeSeq=2&afterSeq=1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "bob", &format!("{base}?beforeSeq=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "bob", "/messages/chat/nonsense").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = get(&app, "mallory", base).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "NOT_A_MEMBER");
    }

    #[tokio::test]
    async fn context_centers_on_seq() {
        let app = seeded(20).await;
        let (status, body) = get(
            &app,
            "alice",
            "/messages/context?chatId=p:alice:bob&seq=10&limit=6",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seqs(&body), vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(body["hasMoreBefore"], true);
        assert_eq!(body["hasMoreAfter"], true);

        let (_, body) = get(&app, "alice", "/messages/context?chatId=p:alice:bob&seq=2&limit=6").await;
        assert_eq!(seqs(&body), vec![1, 2, 3, 4]);
        assert_eq!(body["hasMoreBefore"], false);
    }

    #[tokio::test]
    async fn own_messages_show_peer_progress() {
        let app = seeded(2).await;
        let chat: ChatId = "p:alice:bob".parse().unwrap();
        app.dispatcher
            .mark_read(&UserId::from("bob"), &chat, 1)
            .await
            .unwrap();
        let (_, body) = get(&app, "alice", "/messages/chat/p:alice:bob").await;
        assert_eq!(body["messages"][0]["status"], "read");
        assert_eq!(body["messages"][0]["readCount"], 1);
    }
}
