//! Message rows.
//!
//! Saving applies the same reconciliation as the in-memory chat store
//! ([`Message::reconcile`]): newer revision wins, delivery progress never
//! regresses. Only sequenced messages are cached.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use seqline_shared::{ChatId, Message, MessageId};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Outcome of a save batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Messages without a seq, or whose seq is already held by another id.
    pub skipped: usize,
}

impl Database {
    /// Save a batch of messages in one transaction and refresh chat metadata.
    pub fn save_messages(&mut self, messages: &[Message]) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        let mut touched: BTreeMap<String, u64> = BTreeMap::new();

        let tx = self.conn_mut().transaction()?;
        for message in messages {
            let Some(seq) = message.seq() else {
                report.skipped += 1;
                continue;
            };
            match save_one(&tx, message, seq)? {
                SaveOutcome::Inserted => report.inserted += 1,
                SaveOutcome::Updated => report.updated += 1,
                SaveOutcome::Unchanged => report.unchanged += 1,
                SaveOutcome::SeqTaken => {
                    report.skipped += 1;
                    continue;
                }
            }
            let entry = touched.entry(message.chat_id.to_string()).or_insert(0);
            *entry = (*entry).max(seq);
        }

        let now = Utc::now().timestamp_millis();
        for (chat_id, last_seq) in &touched {
            tx.execute(
                "INSERT INTO chat_meta (chat_id, last_seq, last_fetched, message_count)
                 VALUES (?1, ?2, ?3, (SELECT COUNT(*) FROM messages WHERE chat_id = ?1))
                 ON CONFLICT(chat_id) DO UPDATE SET
                    last_seq = MAX(chat_meta.last_seq, excluded.last_seq),
                    last_fetched = excluded.last_fetched,
                    message_count = excluded.message_count",
                params![chat_id, *last_seq as i64, now],
            )?;
        }
        tx.commit()?;

        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            chats = touched.len(),
            "saved messages to cache"
        );
        Ok(report)
    }

    /// The newest `limit` messages of a chat, in ascending seq order.
    pub fn load_recent(&self, chat_id: &ChatId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT body FROM messages
             WHERE chat_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id.to_string(), limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = decode_rows(rows)?;
        out.reverse();
        Ok(out)
    }

    /// Up to `limit` messages strictly older than `before_seq`, ascending.
    pub fn load_before(
        &self,
        chat_id: &ChatId,
        before_seq: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT body FROM messages
             WHERE chat_id = ?1 AND seq < ?2
             ORDER BY seq DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![chat_id.to_string(), before_seq as i64, limit],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = decode_rows(rows)?;
        out.reverse();
        Ok(out)
    }

    /// Look up messages by id. Missing ids are skipped.
    pub fn load_by_ids(&self, ids: &[MessageId]) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT body FROM messages WHERE id = ?1")?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let body: Option<String> = stmt
                .query_row(params![id.to_string()], |row| row.get(0))
                .optional()?;
            if let Some(body) = body {
                out.push(serde_json::from_str(&body)?);
            }
        }
        Ok(out)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let body: String = self
            .conn()
            .query_row(
                "SELECT body FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn count_messages(&self, chat_id: Option<&ChatId>) -> Result<u64> {
        let count: i64 = match chat_id {
            Some(chat) => self.conn().query_row(
                "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
                params![chat.to_string()],
                |row| row.get(0),
            )?,
            None => self
                .conn()
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }
}

enum SaveOutcome {
    Inserted,
    Updated,
    Unchanged,
    SeqTaken,
}

fn save_one(tx: &Transaction<'_>, message: &Message, seq: u64) -> Result<SaveOutcome> {
    let id = message.id.to_string();
    let stored: Option<String> = tx
        .query_row(
            "SELECT body FROM messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        Some(body) => {
            let stored: Message = serde_json::from_str(&body)?;
            let Some(next) = Message::reconcile(&stored, message) else {
                return Ok(SaveOutcome::Unchanged);
            };
            tx.execute(
                "UPDATE messages SET revision = ?2, body = ?3 WHERE id = ?1",
                params![
                    id,
                    next.revision().timestamp_millis(),
                    serde_json::to_string(&next)?
                ],
            )?;
            Ok(SaveOutcome::Updated)
        }
        None => {
            let inserted = tx.execute(
                "INSERT INTO messages (id, chat_id, seq, sender_id, sent_at, revision, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    id,
                    message.chat_id.to_string(),
                    seq as i64,
                    message.sender_id.as_str(),
                    message.sent_at.timestamp_millis(),
                    message.revision().timestamp_millis(),
                    serde_json::to_string(message)?,
                ],
            )?;
            if inserted == 0 {
                tracing::warn!(
                    chat = %message.chat_id,
                    seq,
                    id = %message.id,
                    "seq already cached under another id, skipping"
                );
                return Ok(SaveOutcome::SeqTaken);
            }
            Ok(SaveOutcome::Inserted)
        }
    }
}

fn decode_rows<F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<Message>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<String>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
