//! Realtime transport frames.
//!
//! Both directions are closed, internally tagged enums wrapped in a frame
//! that carries the frame version `v`. Anything that does not parse into
//! one of the known variants is rejected at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::REALTIME_PROTOCOL_VERSION;
use crate::error::ErrorCode;
use crate::types::{Attachment, ChatId, GroupId, Message, MessageId, MessageKind, UserId};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported frame version {0}")]
    Version(u32),
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    SendMessage {
        /// Correlates the server `ack` with this send.
        ack_id: String,
        #[serde(default)]
        receiver_id: Option<UserId>,
        #[serde(default)]
        group_id: Option<GroupId>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    TypingStart {
        chat_id: ChatId,
    },
    TypingStop {
        chat_id: ChatId,
    },
    PresenceSubscribe {
        user_ids: Vec<UserId>,
    },
    ReadChat {
        chat_id: ChatId,
        seq: u64,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientFrame {
    pub v: u32,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientFrame {
    pub fn new(event: ClientEvent) -> Self {
        Self {
            v: REALTIME_PROTOCOL_VERSION,
            event,
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_str(text)?;
        if frame.v != REALTIME_PROTOCOL_VERSION {
            return Err(FrameError::Version(frame.v));
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupAction {
    GroupUpdated,
    GroupDeleted,
    MemberAdded,
    MemberRemoved,
    MemberLeft,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
    },
    AuthError {
        message: String,
    },
    Ack {
        ack_id: String,
        ok: bool,
        #[serde(default)]
        message_id: Option<MessageId>,
        #[serde(default)]
        chat_id: Option<ChatId>,
        #[serde(default)]
        seq: Option<u64>,
        #[serde(default)]
        error: Option<ErrorCode>,
    },
    Message {
        message: Message,
    },
    GroupUpdate {
        group_id: GroupId,
        action: GroupAction,
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        payload: serde_json::Value,
    },
    ReadReceipt {
        chat_id: ChatId,
        seq: u64,
        read_count: u32,
        reader_id: UserId,
    },
    Presence {
        user_id: UserId,
        is_online: bool,
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        is_typing: bool,
    },
    Batch {
        events: Vec<ServerEvent>,
    },
    Pong,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    /// Flatten nested batches into their events, in order.
    pub fn into_events(self) -> Vec<ServerEvent> {
        match self {
            Self::Batch { events } => events.into_iter().flat_map(Self::into_events).collect(),
            other => vec![other],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerFrame {
    pub v: u32,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerFrame {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            v: REALTIME_PROTOCOL_VERSION,
            event,
        }
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_str(text)?;
        if frame.v != REALTIME_PROTOCOL_VERSION {
            return Err(FrameError::Version(frame.v));
        }
        Ok(frame)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_chat_frame_parses() {
        let text = r#"{"v":1,"type":"readChat","chatId":"p:b:a","seq":7}"#;
        let frame = ClientFrame::decode(text).unwrap();
        assert_eq!(
            frame.event,
            ClientEvent::ReadChat {
                chat_id: "p:a:b".parse().unwrap(),
                seq: 7
            }
        );
    }

    #[test]
    fn send_message_defaults_optional_fields() {
        let text = r#"{"v":1,"type":"sendMessage","ackId":"a1","receiverId":"bob","content":"hello"}"#;
        match ClientFrame::decode(text).unwrap().event {
            ClientEvent::SendMessage {
                ack_id,
                receiver_id,
                group_id,
                kind,
                attachments,
                ..
            } => {
                assert_eq!(ack_id, "a1");
                assert_eq!(receiver_id, Some(UserId::from("bob")));
                assert!(group_id.is_none());
                assert_eq!(kind, MessageKind::Text);
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let text = r#"{"v":1,"type":"dropTables"}"#;
        assert!(matches!(
            ClientFrame::decode(text),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let text = r#"{"v":9,"type":"ping"}"#;
        assert!(matches!(ClientFrame::decode(text), Err(FrameError::Version(9))));
    }

    #[test]
    fn batch_frames_flatten() {
        let frame = ServerFrame::new(ServerEvent::Batch {
            events: vec![
                ServerEvent::Pong,
                ServerEvent::Typing {
                    chat_id: "g:team".parse().unwrap(),
                    user_id: UserId::from("carol"),
                    is_typing: true,
                },
            ],
        });
        let text = frame.encode().unwrap();
        let back = ServerFrame::decode(&text).unwrap();
        let events = back.event.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::Pong);
    }
}
