//! SQLite implementation of the storage traits.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool. Counter
//! increments and cursor updates are single `INSERT .. ON CONFLICT .. DO
//! UPDATE` statements; the update log appends inside a transaction so a
//! user's `update_id` values stay gapless.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use seqline_shared::protocol::{Update, UpdateKind};
use seqline_shared::types::{Attachment, ChatMemberState, GroupState};
use seqline_shared::{ChatId, GroupId, Message, MessageId, MessageKind, MessageStatus, UserId};

use super::migrations;
use super::{
    ChatStore, CounterStore, DbError, DbResult, GroupMember, GroupRecord, MemberStatus,
    MembershipDirectory, UpdateEvent, UpdateLog,
};

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DbResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| DbError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    // ── Directory seeding ────────────────────────────────────────────────

    /// Create or update a group row. Group CRUD belongs to the account
    /// service; this exists for provisioning and tests.
    pub async fn upsert_group(&self, group: &GroupRecord) -> DbResult<()> {
        let group = group.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO groups (id, name, is_active, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_active = excluded.is_active",
                params![
                    group.id.as_str(),
                    group.name,
                    group.is_active,
                    Utc::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_member(&self, member: &GroupMember) -> DbResult<()> {
        let member = member.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, role, status, muted_until, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(group_id, user_id) DO UPDATE SET
                    role = excluded.role,
                    status = excluded.status,
                    muted_until = excluded.muted_until",
                params![
                    member.group_id.as_str(),
                    member.user_id.as_str(),
                    member.role,
                    member.status.as_str(),
                    member.muted_until.map(|t| t.timestamp_millis()),
                    Utc::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[async_trait]
impl CounterStore for SqliteStore {
    async fn increment_chat_counter(&self, chat_id: &ChatId) -> DbResult<u64> {
        let key = chat_id.to_string();
        self.call(move |conn| {
            let seq: i64 = conn.query_row(
                "INSERT INTO chat_counters (chat_id, seq) VALUES (?1, 1)
                 ON CONFLICT(chat_id) DO UPDATE SET seq = seq + 1
                 RETURNING seq",
                params![key],
                |row| row.get(0),
            )?;
            Ok(seq as u64)
        })
        .await
    }

    async fn chat_counter(&self, chat_id: &ChatId) -> DbResult<u64> {
        let key = chat_id.to_string();
        self.call(move |conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM chat_counters WHERE chat_id = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(0).max(0) as u64)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Messages and cursors
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str =
    "id, chat_id, seq, sender_id, kind, content, attachments, reply_to, sent_at, edited_at, deleted_at";

#[async_trait]
impl ChatStore for SqliteStore {
    async fn insert_message(&self, message: &Message) -> DbResult<()> {
        let message = message.clone();
        let seq = message
            .seq()
            .ok_or_else(|| DbError::Corrupt(format!("message {} has no seq", message.id)))?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO messages
                    (id, chat_id, seq, sender_id, kind, content, attachments, reply_to,
                     sent_at, edited_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    message.id.to_string(),
                    message.chat_id.to_string(),
                    seq as i64,
                    message.sender_id.as_str(),
                    message.kind.as_str(),
                    message.content,
                    serde_json::to_string(&message.attachments)?,
                    message.reply_to.map(|r| r.to_string()),
                    message.sent_at.timestamp_millis(),
                    message.edited_at.map(|t| t.timestamp_millis()),
                    message.deleted_at.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn messages_by_ids(&self, ids: &[MessageId]) -> DbResult<Vec<Message>> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(m) = stmt.query_row(params![id], row_to_message).optional()? {
                    out.push(m);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn message_by_seq(&self, chat_id: &ChatId, seq: u64) -> DbResult<Option<Message>> {
        let key = chat_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 AND seq = ?2"),
                    params![key, seq as i64],
                    row_to_message,
                )
                .optional()?)
        })
        .await
    }

    async fn messages_before(
        &self,
        chat_id: &ChatId,
        before: Option<u64>,
        limit: u32,
    ) -> DbResult<Vec<Message>> {
        let key = chat_id.to_string();
        let before = before.map(|b| b as i64).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND seq < ?2
                 ORDER BY seq DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![key, before, limit], row_to_message)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn messages_from(
        &self,
        chat_id: &ChatId,
        from: u64,
        limit: u32,
    ) -> DbResult<Vec<Message>> {
        let key = chat_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND seq >= ?2
                 ORDER BY seq ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![key, from as i64, limit], row_to_message)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn advance_member_state(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        delivered: u64,
        read: Option<u64>,
    ) -> DbResult<ChatMemberState> {
        let chat = chat_id.to_string();
        let user = user_id.to_string();
        let read = read.unwrap_or(0);
        let delivered = delivered.max(read);
        self.call(move |conn| {
            let (r, d): (i64, i64) = conn.query_row(
                "INSERT INTO chat_member_state (chat_id, user_id, last_read_seq, last_delivered_seq)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_id, user_id) DO UPDATE SET
                    last_read_seq = MAX(chat_member_state.last_read_seq, excluded.last_read_seq),
                    last_delivered_seq = MAX(chat_member_state.last_delivered_seq,
                                             excluded.last_delivered_seq)
                 RETURNING last_read_seq, last_delivered_seq",
                params![chat, user, read as i64, delivered as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(ChatMemberState {
                last_read_seq: r as u64,
                last_delivered_seq: d as u64,
            })
        })
        .await
    }

    async fn member_state(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> DbResult<Option<ChatMemberState>> {
        let chat = chat_id.to_string();
        let user = user_id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT last_read_seq, last_delivered_seq FROM chat_member_state
                     WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat, user],
                    |row| {
                        Ok(ChatMemberState {
                            last_read_seq: row.get::<_, i64>(0)? as u64,
                            last_delivered_seq: row.get::<_, i64>(1)? as u64,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn count_readers(&self, chat_id: &ChatId, seq: u64, author: &UserId) -> DbResult<u32> {
        let chat = chat_id.to_string();
        let author = author.to_string();
        self.call(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_member_state
                 WHERE chat_id = ?1 AND last_read_seq >= ?2 AND user_id <> ?3",
                params![chat, seq as i64, author],
                |row| row.get(0),
            )?;
            Ok(n as u32)
        })
        .await
    }

    async fn advance_group_state(&self, state: &GroupState) -> DbResult<()> {
        let state = state.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO group_state (group_id, last_seq, last_message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(group_id) DO UPDATE SET
                    last_message_id = CASE WHEN excluded.last_seq > group_state.last_seq
                                           THEN excluded.last_message_id
                                           ELSE group_state.last_message_id END,
                    last_seq = MAX(group_state.last_seq, excluded.last_seq),
                    updated_at = excluded.updated_at",
                params![
                    state.group_id.as_str(),
                    state.last_seq as i64,
                    state.last_message_id.to_string(),
                    Utc::now().timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn group_state(&self, group_id: &GroupId) -> DbResult<Option<GroupState>> {
        let group = group_id.clone();
        self.call(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT last_seq, last_message_id FROM group_state WHERE group_id = ?1",
                    params![group.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(last_seq, id)| {
                Ok(GroupState {
                    group_id: group.clone(),
                    last_seq: last_seq as u64,
                    last_message_id: id
                        .parse()
                        .map_err(|e: uuid::Error| DbError::Corrupt(e.to_string()))?,
                })
            })
            .transpose()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Group directory
// ---------------------------------------------------------------------------

#[async_trait]
impl MembershipDirectory for SqliteStore {
    async fn group(&self, group_id: &GroupId) -> DbResult<Option<GroupRecord>> {
        let group = group_id.clone();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, is_active FROM groups WHERE id = ?1",
                    params![group.as_str()],
                    |row| {
                        Ok(GroupRecord {
                            id: GroupId::new(row.get::<_, String>(0)?),
                            name: row.get(1)?,
                            is_active: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn membership(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> DbResult<Option<GroupMember>> {
        let group = group_id.clone();
        let user = user_id.clone();
        self.call(move |conn| {
            let row: Option<(String, String, Option<i64>)> = conn
                .query_row(
                    "SELECT role, status, muted_until FROM group_members
                     WHERE group_id = ?1 AND user_id = ?2",
                    params![group.as_str(), user.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(role, status, muted_until)| {
                let status = MemberStatus::parse(&status)
                    .ok_or_else(|| DbError::Corrupt(format!("member status {status}")))?;
                Ok(GroupMember {
                    group_id: group.clone(),
                    user_id: user.clone(),
                    status,
                    role,
                    muted_until: muted_until.map(millis),
                })
            })
            .transpose()
        })
        .await
    }

    async fn clear_mute(&self, group_id: &GroupId, user_id: &UserId) -> DbResult<()> {
        let group = group_id.clone();
        let user = user_id.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE group_members
                 SET status = CASE WHEN status = 'muted' THEN 'active' ELSE status END,
                     muted_until = NULL
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group.as_str(), user.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn receiving_members(&self, group_id: &GroupId) -> DbResult<Vec<UserId>> {
        let group = group_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM group_members
                 WHERE group_id = ?1 AND status IN ('active', 'muted')
                 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![group.as_str()], |row| {
                row.get::<_, String>(0).map(UserId::new)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn groups_of(&self, user_id: &UserId) -> DbResult<Vec<GroupId>> {
        let user = user_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT gm.group_id FROM group_members gm
                 JOIN groups g ON g.id = gm.group_id
                 WHERE gm.user_id = ?1
                   AND gm.status IN ('active', 'muted')
                   AND g.is_active = 1",
            )?;
            let rows = stmt.query_map(params![user.as_str()], |row| {
                row.get::<_, String>(0).map(GroupId::new)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Update log
// ---------------------------------------------------------------------------

#[async_trait]
impl UpdateLog for SqliteStore {
    async fn append_updates(
        &self,
        user_ids: &[UserId],
        event: &UpdateEvent,
    ) -> DbResult<Vec<(UserId, u64)>> {
        let users = user_ids.to_vec();
        let event = event.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let payload = serde_json::to_string(&event.payload)?;
            let now = Utc::now().timestamp_millis();
            let mut out = Vec::with_capacity(users.len());
            for user in users {
                if let Some(key) = &event.dedupe_key {
                    let seen: Option<i64> = tx
                        .query_row(
                            "SELECT update_id FROM update_log WHERE user_id = ?1 AND dedupe_key = ?2",
                            params![user.as_str(), key],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if seen.is_some() {
                        continue;
                    }
                }
                let pts: i64 = tx.query_row(
                    "INSERT INTO update_counters (user_id, pts) VALUES (?1, 1)
                     ON CONFLICT(user_id) DO UPDATE SET pts = pts + 1
                     RETURNING pts",
                    params![user.as_str()],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO update_log
                        (user_id, update_id, kind, chat_id, seq, message_id, payload, dedupe_key, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        user.as_str(),
                        pts,
                        event.kind.as_str(),
                        event.chat_id.to_string(),
                        event.seq.map(|s| s as i64),
                        event.message_id.map(|m| m.to_string()),
                        payload,
                        event.dedupe_key,
                        now
                    ],
                )?;
                out.push((user, pts as u64));
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    async fn current_pts(&self, user_id: &UserId) -> DbResult<u64> {
        let user = user_id.clone();
        self.call(move |conn| {
            let pts: Option<i64> = conn
                .query_row(
                    "SELECT pts FROM update_counters WHERE user_id = ?1",
                    params![user.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(pts.unwrap_or(0).max(0) as u64)
        })
        .await
    }

    async fn updates_after(&self, user_id: &UserId, pts: u64, limit: u32) -> DbResult<Vec<Update>> {
        let user = user_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT update_id, kind, chat_id, seq, message_id, payload FROM update_log
                 WHERE user_id = ?1 AND update_id > ?2
                 ORDER BY update_id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![user.as_str(), pts as i64, limit], |row| {
                let kind: String = row.get(1)?;
                let chat: String = row.get(2)?;
                let message_id: Option<String> = row.get(4)?;
                let payload: String = row.get(5)?;
                Ok(Update {
                    update_id: row.get::<_, i64>(0)? as u64,
                    kind: kind.parse::<UpdateKind>().map_err(|e| {
                        conversion(1, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                    })?,
                    chat_id: chat.parse().map_err(|e| conversion(2, e))?,
                    seq: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
                    message_id: message_id
                        .map(|m| m.parse::<MessageId>())
                        .transpose()
                        .map_err(|e| conversion(4, e))?,
                    payload: serde_json::from_str(&payload).map_err(|e| conversion(5, e))?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn record_ack(&self, user_id: &UserId, pts: u64) -> DbResult<u64> {
        let user = user_id.clone();
        self.call(move |conn| {
            let stored: i64 = conn.query_row(
                "INSERT INTO sync_acks (user_id, pts) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET pts = MAX(sync_acks.pts, excluded.pts)
                 RETURNING pts",
                params![user.as_str(), pts as i64],
                |row| row.get(0),
            )?;
            Ok(stored as u64)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let kind: String = row.get(4)?;
    let attachments: String = row.get(6)?;
    let reply_to: Option<String> = row.get(7)?;

    let attachments: Vec<Attachment> =
        serde_json::from_str(&attachments).map_err(|e| conversion(6, e))?;

    Ok(Message {
        id: id.parse().map_err(|e| conversion(0, e))?,
        chat_id: chat_id.parse().map_err(|e| conversion(1, e))?,
        seq: Some(row.get::<_, i64>(2)? as u64),
        sender_id: UserId::new(row.get::<_, String>(3)?),
        kind: kind.parse::<MessageKind>().map_err(|e| conversion(4, e))?,
        content: row.get(5)?,
        attachments,
        status: MessageStatus::Sent,
        read_count: 0,
        sent_at: millis(row.get(8)?),
        edited_at: row.get::<_, Option<i64>>(9)?.map(millis),
        deleted_at: row.get::<_, Option<i64>>(10)?.map(millis),
        reply_to: reply_to
            .map(|r| r.parse::<MessageId>())
            .transpose()
            .map_err(|e| conversion(7, e))?,
    })
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
