//! HTTP wire contract: the pts sync protocol and cursor-based message pages.
//!
//! Sync responses always carry a [`SyncContract`]; a client must refuse any
//! payload whose contract does not match its compiled-in constants.
//! Message pages carry a cursor protocol version and the canonical chat id,
//! and are checked with [`verify_page`] before they are applied.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::constants::{CURSOR_PROTOCOL_VERSION, SYNC_PROTOCOL_VERSION, SYNC_WATERMARK_FIELD};
use crate::error::{ContractError, CursorError};
use crate::types::{ChatId, Message, MessageId};

// ---------------------------------------------------------------------------
// Sync contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncContract {
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub watermark_field: Option<String>,
}

impl SyncContract {
    /// The contract this build speaks.
    pub fn current() -> Self {
        Self {
            protocol_version: Some(SYNC_PROTOCOL_VERSION),
            watermark_field: Some(SYNC_WATERMARK_FIELD.to_string()),
        }
    }

    pub fn verify(&self) -> Result<(), ContractError> {
        if self.protocol_version != Some(SYNC_PROTOCOL_VERSION) {
            return Err(ContractError::ProtocolVersion {
                expected: SYNC_PROTOCOL_VERSION,
                actual: self.protocol_version,
            });
        }
        if self.watermark_field.as_deref() != Some(SYNC_WATERMARK_FIELD) {
            return Err(ContractError::WatermarkField {
                expected: SYNC_WATERMARK_FIELD,
                actual: self.watermark_field.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Message,
    Read,
    MemberChange,
    Edit,
    Delete,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Read => "read",
            Self::MemberChange => "member_change",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for UpdateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "read" => Ok(Self::Read),
            "member_change" => Ok(Self::MemberChange),
            "edit" => Ok(Self::Edit),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown update kind: {other}")),
        }
    }
}

/// One entry of a user's update log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Per-user watermark value (pts) of this entry.
    pub update_id: u64,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub chat_id: ChatId,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a `read` update, addressed to the author of the read message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdatePayload {
    pub reader_id: String,
    pub read_count: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub pts: u64,
    /// Server time, unix seconds.
    #[serde(default)]
    pub date: i64,
}

// ---------------------------------------------------------------------------
// Sync endpoints
// ---------------------------------------------------------------------------

/// `GET /sync/state`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
    #[serde(flatten)]
    pub contract: SyncContract,
    pub pts: u64,
    #[serde(default)]
    pub date: i64,
}

/// `POST /sync/difference`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifferenceRequest {
    pub pts: u64,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferenceResponse {
    #[serde(flatten)]
    pub contract: SyncContract,
    #[serde(default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub state: SyncState,
    pub is_latest: bool,
}

/// `GET /sync/updates?pts=&timeout=`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesQuery {
    #[serde(default)]
    pub pts: u64,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesResponse {
    #[serde(flatten)]
    pub contract: SyncContract,
    #[serde(default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub state: SyncState,
}

/// `POST /sync/ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub pts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub acknowledged: bool,
    pub pts: u64,
}

// ---------------------------------------------------------------------------
// Message listing
// ---------------------------------------------------------------------------

/// `GET /messages/chat/{chatId}` query. `beforeSeq` and `afterSeq` are
/// mutually exclusive; neither means "latest page".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PageMode {
    Latest,
    Before,
    After,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    pub has_more: bool,
    #[serde(default)]
    pub next_before_seq: Option<u64>,
    #[serde(default)]
    pub next_after_seq: Option<u64>,
    #[serde(default)]
    pub latest_seq: u64,
    pub mode: PageMode,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Canonical chat id echoed by the server.
    pub chat_id: String,
    pub cursor_protocol: u32,
    pub messages: Vec<Message>,
    pub paging: Paging,
}

/// `GET /messages/context?chatId=&seq=&limit=`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQuery {
    pub chat_id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPage {
    pub chat_id: String,
    pub seq: u64,
    pub messages: Vec<Message>,
    pub has_more_before: bool,
    pub has_more_after: bool,
}

/// Check a listing page against the chat it was requested for.
pub fn verify_page(requested: &ChatId, page: &MessagePage) -> Result<(), CursorError> {
    if page.cursor_protocol != CURSOR_PROTOCOL_VERSION {
        return Err(CursorError::Protocol {
            expected: CURSOR_PROTOCOL_VERSION,
            actual: page.cursor_protocol,
        });
    }
    verify_echo(requested, &page.chat_id)?;
    verify_messages(requested, &page.messages)
}

pub fn verify_context(requested: &ChatId, page: &ContextPage) -> Result<(), CursorError> {
    verify_echo(requested, &page.chat_id)?;
    verify_messages(requested, &page.messages)
}

fn verify_echo(requested: &ChatId, echoed: &str) -> Result<(), CursorError> {
    match echoed.parse::<ChatId>() {
        Ok(id) if &id == requested => Ok(()),
        _ => Err(CursorError::ChatMismatch {
            expected: requested.to_string(),
            actual: echoed.to_string(),
        }),
    }
}

/// Messages must all belong to `requested`, carry strictly ascending seqs,
/// and never repeat an id.
pub fn verify_messages(requested: &ChatId, messages: &[Message]) -> Result<(), CursorError> {
    let mut seen = HashSet::with_capacity(messages.len());
    let mut prev: Option<u64> = None;
    for (index, m) in messages.iter().enumerate() {
        if &m.chat_id != requested {
            return Err(CursorError::ChatMismatch {
                expected: requested.to_string(),
                actual: m.chat_id.to_string(),
            });
        }
        if !seen.insert(m.id) {
            return Err(CursorError::DuplicateId(m.id.to_string()));
        }
        let seq = m.seq().ok_or(CursorError::NonMonotonic { index })?;
        if prev.is_some_and(|p| seq <= p) {
            return Err(CursorError::NonMonotonic { index });
        }
        prev = Some(seq);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, MessageStatus, UserId};
    use chrono::Utc;

    fn chat() -> ChatId {
        "p:alice:bob".parse().unwrap()
    }

    fn message(seq: u64) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: chat(),
            seq: Some(seq),
            sender_id: UserId::from("alice"),
            kind: MessageKind::Text,
            content: format!("m{seq}"),
            attachments: vec![],
            status: MessageStatus::Sent,
            read_count: 0,
            sent_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            reply_to: None,
        }
    }

    fn page(messages: Vec<Message>) -> MessagePage {
        MessagePage {
            chat_id: "p:bob:alice".into(),
            cursor_protocol: CURSOR_PROTOCOL_VERSION,
            messages,
            paging: Paging {
                has_more: false,
                next_before_seq: None,
                next_after_seq: None,
                latest_seq: 3,
                mode: PageMode::Latest,
                limit: 50,
            },
        }
    }

    #[test]
    fn contract_accepts_current_and_rejects_skew() {
        assert!(SyncContract::current().verify().is_ok());

        let old = SyncContract {
            protocol_version: Some(1),
            ..SyncContract::current()
        };
        assert!(matches!(old.verify(), Err(ContractError::ProtocolVersion { .. })));

        let missing = SyncContract::default();
        assert!(missing.verify().is_err());

        let wrong_field = SyncContract {
            watermark_field: Some("pts".into()),
            ..SyncContract::current()
        };
        assert!(matches!(
            wrong_field.verify(),
            Err(ContractError::WatermarkField { .. })
        ));
    }

    #[test]
    fn difference_response_uses_flat_contract_fields() {
        let json = serde_json::json!({
            "protocolVersion": 2,
            "watermarkField": "updateId",
            "updates": [],
            "messages": [],
            "state": { "pts": 15, "date": 0 },
            "isLatest": true
        });
        let parsed: DifferenceResponse = serde_json::from_value(json).unwrap();
        assert!(parsed.contract.verify().is_ok());
        assert_eq!(parsed.state.pts, 15);
        assert!(parsed.is_latest);
    }

    #[test]
    fn page_with_canonical_echo_passes() {
        let p = page(vec![message(1), message(2), message(3)]);
        assert!(verify_page(&chat(), &p).is_ok());
    }

    #[test]
    fn page_rejects_out_of_order_seq() {
        let p = page(vec![message(2), message(1)]);
        assert_eq!(
            verify_page(&chat(), &p),
            Err(CursorError::NonMonotonic { index: 1 })
        );
    }

    #[test]
    fn page_rejects_duplicate_ids() {
        let a = message(1);
        let mut b = a.clone();
        b.seq = Some(2);
        let p = page(vec![a, b]);
        assert!(matches!(verify_page(&chat(), &p), Err(CursorError::DuplicateId(_))));
    }

    #[test]
    fn page_rejects_foreign_chat() {
        let mut p = page(vec![message(1)]);
        p.chat_id = "g:other".into();
        assert!(matches!(
            verify_page(&chat(), &p),
            Err(CursorError::ChatMismatch { .. })
        ));

        let mut stray = message(2);
        stray.chat_id = "g:other".parse().unwrap();
        let p = page(vec![message(1), stray]);
        assert!(matches!(
            verify_page(&chat(), &p),
            Err(CursorError::ChatMismatch { .. })
        ));
    }

    #[test]
    fn page_rejects_wrong_cursor_protocol() {
        let mut p = page(vec![]);
        p.cursor_protocol = 0;
        assert!(matches!(verify_page(&chat(), &p), Err(CursorError::Protocol { .. })));
    }
}
