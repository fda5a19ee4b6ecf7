//! Storage abstraction for the server.
//!
//! The dispatcher, the sync API and the realtime transport only see the
//! traits below. [`sqlite::SqliteStore`] implements all of them on a single
//! SQLite database; every state change is one atomic statement or one
//! transaction, so concurrent callers never need application-level locks.

pub mod migrations;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use seqline_shared::protocol::{Update, UpdateKind};
use seqline_shared::types::{ChatMemberState, GroupState};
use seqline_shared::{ChatId, GroupId, Message, MessageId, UserId};

pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Connection lock poisoned")]
    Poisoned,

    #[error("Stored payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// The storage handles a running server needs, as trait objects.
#[derive(Clone)]
pub struct Backend {
    pub counters: Arc<dyn CounterStore>,
    pub chats: Arc<dyn ChatStore>,
    pub directory: Arc<dyn MembershipDirectory>,
    pub log: Arc<dyn UpdateLog>,
}

impl Backend {
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            counters: store.clone(),
            chats: store.clone(),
            directory: store.clone(),
            log: store,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Muted,
    Banned,
    Left,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Muted => "muted",
            Self::Banned => "banned",
            Self::Left => "left",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "muted" => Some(Self::Muted),
            "banned" => Some(Self::Banned),
            "left" => Some(Self::Left),
            _ => None,
        }
    }

    /// Members in these states receive fanout.
    pub fn receives_messages(&self) -> bool {
        matches!(self, Self::Active | Self::Muted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub status: MemberStatus,
    pub role: String,
    pub muted_until: Option<DateTime<Utc>>,
}

/// One event to append to several users' update logs.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub kind: UpdateKind,
    pub chat_id: ChatId,
    pub seq: Option<u64>,
    pub message_id: Option<MessageId>,
    pub payload: serde_json::Value,
    /// When set, a user's log holds at most one entry with this key, which
    /// makes redelivered fanout jobs harmless.
    pub dedupe_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Atomic per-chat counters.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Create-if-absent and increment, returning the new value.
    async fn increment_chat_counter(&self, chat_id: &ChatId) -> DbResult<u64>;

    /// Highest seq assigned so far, 0 for an unknown chat.
    async fn chat_counter(&self, chat_id: &ChatId) -> DbResult<u64>;
}

#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    // ── Messages ─────────────────────────────────────────────────────────
    async fn insert_message(&self, message: &Message) -> DbResult<()>;
    async fn messages_by_ids(&self, ids: &[MessageId]) -> DbResult<Vec<Message>>;
    async fn message_by_seq(&self, chat_id: &ChatId, seq: u64) -> DbResult<Option<Message>>;

    /// Messages with `seq < before` (or the newest when `None`), newest first.
    async fn messages_before(
        &self,
        chat_id: &ChatId,
        before: Option<u64>,
        limit: u32,
    ) -> DbResult<Vec<Message>>;

    /// Messages with `seq >= from`, oldest first.
    async fn messages_from(&self, chat_id: &ChatId, from: u64, limit: u32)
        -> DbResult<Vec<Message>>;

    // ── Member cursors ───────────────────────────────────────────────────
    /// Take-max upsert of a member's delivered (and optionally read) seq.
    async fn advance_member_state(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        delivered: u64,
        read: Option<u64>,
    ) -> DbResult<ChatMemberState>;

    async fn member_state(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> DbResult<Option<ChatMemberState>>;

    /// Members other than `author` whose read cursor reached `seq`.
    async fn count_readers(&self, chat_id: &ChatId, seq: u64, author: &UserId) -> DbResult<u32>;

    // ── Group pointer ────────────────────────────────────────────────────
    /// Take-max upsert of the shared pointer of a large group.
    async fn advance_group_state(&self, state: &GroupState) -> DbResult<()>;
    async fn group_state(&self, group_id: &GroupId) -> DbResult<Option<GroupState>>;
}

/// Read side of the group/member tables owned by the account service.
#[async_trait]
pub trait MembershipDirectory: Send + Sync + 'static {
    async fn group(&self, group_id: &GroupId) -> DbResult<Option<GroupRecord>>;
    async fn membership(&self, group_id: &GroupId, user_id: &UserId)
        -> DbResult<Option<GroupMember>>;
    /// Lift an expired mute: status back to active, `muted_until` cleared.
    async fn clear_mute(&self, group_id: &GroupId, user_id: &UserId) -> DbResult<()>;
    /// Members in `active` or `muted` state.
    async fn receiving_members(&self, group_id: &GroupId) -> DbResult<Vec<UserId>>;
    async fn groups_of(&self, user_id: &UserId) -> DbResult<Vec<GroupId>>;
}

/// Per-user append-only update log.
#[async_trait]
pub trait UpdateLog: Send + Sync + 'static {
    /// Append `event` to each user's log; returns the resulting pts per user
    /// (users whose log already holds the dedupe key are skipped).
    async fn append_updates(
        &self,
        user_ids: &[UserId],
        event: &UpdateEvent,
    ) -> DbResult<Vec<(UserId, u64)>>;

    async fn current_pts(&self, user_id: &UserId) -> DbResult<u64>;

    /// Entries with `update_id > pts`, ascending, at most `limit`.
    async fn updates_after(&self, user_id: &UserId, pts: u64, limit: u32) -> DbResult<Vec<Update>>;

    /// Remember the highest pts a client acknowledged. Returns the stored value.
    async fn record_ack(&self, user_id: &UserId, pts: u64) -> DbResult<u64>;
}
