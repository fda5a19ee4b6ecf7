use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatIdError, UnknownMessageKind};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque user identifier issued by the account service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Globally unique message id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Chat identity
// ---------------------------------------------------------------------------

/// Composite chat key.
///
/// Private chats are keyed by both participants, stored in sorted order so
/// that `p:alice:bob` and `p:bob:alice` name the same chat. Group chats are
/// keyed by the group id. The text form is `p:<low>:<high>` or `g:<group>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatId {
    Private { low: UserId, high: UserId },
    Group(GroupId),
}

impl ChatId {
    pub fn private(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self::Private {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self::Private {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    pub fn group(id: &GroupId) -> Self {
        Self::Group(id.clone())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Self::Group(g) => Some(g),
            Self::Private { .. } => None,
        }
    }

    /// The other participant of a private chat, seen from `me`.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        match self {
            Self::Private { low, high } if low == me => Some(high),
            Self::Private { low, high } if high == me => Some(low),
            _ => None,
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        match self {
            Self::Private { low, high } => low == user || high == user,
            Self::Group(_) => false,
        }
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private { low, high } => write!(f, "p:{low}:{high}"),
            Self::Group(g) => write!(f, "g:{g}"),
        }
    }
}

impl FromStr for ChatId {
    type Err = ChatIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("g:") {
            if rest.is_empty() {
                return Err(ChatIdError::Empty);
            }
            return Ok(Self::Group(GroupId::new(rest)));
        }
        if let Some(rest) = s.strip_prefix("p:") {
            let (a, b) = rest
                .split_once(':')
                .ok_or_else(|| ChatIdError::Malformed(s.to_string()))?;
            if a.is_empty() || b.is_empty() || b.contains(':') {
                return Err(ChatIdError::Malformed(s.to_string()));
            }
            return Ok(Self::private(&UserId::from(a), &UserId::from(b)));
        }
        Err(ChatIdError::UnknownKind(s.to_string()))
    }
}

impl TryFrom<String> for ChatId {
    type Error = ChatIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatId> for String {
    fn from(value: ChatId) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "system" => Ok(Self::System),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// Delivery lifecycle of a message as seen by its sender.
///
/// Variants are declared in progress order so that `max` picks the most
/// advanced state; `Failed` ranks lowest so any server copy replaces it.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Failed,
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// Chat-local sequence number. `None` only before the server assigned one.
    #[serde(default)]
    pub seq: Option<u64>,
    pub sender_id: UserId,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub read_count: u32,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl Message {
    /// Positive seq, if assigned. A zero seq is treated as unassigned.
    pub fn seq(&self) -> Option<u64> {
        self.seq.filter(|s| *s > 0)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Version stamp used for last-write-wins reconciliation.
    pub fn revision(&self) -> DateTime<Utc> {
        let mut rev = self.sent_at;
        if let Some(edited) = self.edited_at {
            rev = rev.max(edited);
        }
        if let Some(deleted) = self.deleted_at {
            rev = rev.max(deleted);
        }
        rev
    }

    /// Total display order: unsequenced messages first, then ascending seq,
    /// ties broken by timestamp and finally id.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        match (self.seq(), other.seq()) {
            (Some(a), Some(b)) if a != b => return a.cmp(&b),
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            _ => {}
        }
        self.sent_at
            .cmp(&other.sent_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Reconcile a stored copy with an incoming copy of the same message.
    ///
    /// The copy with the newer [`revision`](Self::revision) wins; on a tie the
    /// stored copy is kept. Delivery progress never moves backwards: the
    /// result carries the higher status and read count of the two.
    /// Returns `None` when the stored copy is already up to date.
    pub fn reconcile(stored: &Message, incoming: &Message) -> Option<Message> {
        let mut next = if incoming.revision() > stored.revision() {
            incoming.clone()
        } else {
            stored.clone()
        };
        next.status = stored.status.max(incoming.status);
        next.read_count = stored.read_count.max(incoming.read_count);
        if next.seq().is_none() {
            next.seq = stored.seq().or(incoming.seq());
        }
        if &next == stored {
            None
        } else {
            Some(next)
        }
    }
}

/// Per (chat, user) delivery cursor. Both counters only move forward.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMemberState {
    pub last_read_seq: u64,
    pub last_delivered_seq: u64,
}

/// Shared pointer for groups above the fanout threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    pub group_id: GroupId,
    pub last_seq: u64,
    pub last_message_id: MessageId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn msg(seq: Option<u64>, secs: i64) -> Message {
        Message {
            id: MessageId::new(),
            chat_id: "g:team".parse().unwrap(),
            seq,
            sender_id: UserId::from("alice"),
            kind: MessageKind::Text,
            content: "hi".into(),
            attachments: vec![],
            status: MessageStatus::Sent,
            read_count: 0,
            sent_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            edited_at: None,
            deleted_at: None,
            reply_to: None,
        }
    }

    #[test]
    fn private_chat_id_is_canonical() {
        let a: ChatId = "p:bob:alice".parse().unwrap();
        let b = ChatId::private(&UserId::from("alice"), &UserId::from("bob"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "p:alice:bob");
        assert_eq!(a.peer_of(&UserId::from("alice")), Some(&UserId::from("bob")));
    }

    #[test]
    fn chat_id_rejects_garbage() {
        assert!("x:1".parse::<ChatId>().is_err());
        assert!("p:alice".parse::<ChatId>().is_err());
        assert!("p::bob".parse::<ChatId>().is_err());
        assert!("g:".parse::<ChatId>().is_err());
    }

    #[test]
    fn chat_id_serializes_as_string() {
        let id = ChatId::group(&GroupId::from("team"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"g:team\"");
        let back: ChatId = serde_json::from_str("\"p:z:a\"").unwrap();
        assert_eq!(back.to_string(), "p:a:z");
    }

    #[test]
    fn unsequenced_sorts_before_sequenced() {
        let pending = msg(None, 100);
        let first = msg(Some(1), 0);
        assert_eq!(pending.display_cmp(&first), Ordering::Less);
        assert_eq!(msg(Some(2), 0).display_cmp(&msg(Some(3), -5)), Ordering::Less);
    }

    #[test]
    fn reconcile_prefers_newer_revision_and_keeps_status() {
        let mut stored = msg(Some(4), 0);
        stored.status = MessageStatus::Read;
        stored.read_count = 3;

        let mut edited = stored.clone();
        edited.content = "edited".into();
        edited.status = MessageStatus::Sent;
        edited.read_count = 0;
        edited.edited_at = Some(stored.sent_at + Duration::seconds(30));

        let merged = Message::reconcile(&stored, &edited).unwrap();
        assert_eq!(merged.content, "edited");
        assert_eq!(merged.status, MessageStatus::Read);
        assert_eq!(merged.read_count, 3);

        assert!(Message::reconcile(&merged, &stored).is_none());
    }
}
