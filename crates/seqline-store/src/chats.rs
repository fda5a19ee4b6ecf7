//! Per-chat metadata rows.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use seqline_shared::ChatId;

use crate::database::Database;
use crate::error::Result;
use crate::messages::millis_to_datetime;
use crate::models::ChatMeta;

impl Database {
    pub fn get_chat_meta(&self, chat_id: &ChatId) -> Result<Option<ChatMeta>> {
        let row = self
            .conn()
            .query_row(
                "SELECT chat_id, last_seq, last_fetched, message_count
                 FROM chat_meta WHERE chat_id = ?1",
                params![chat_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(row_to_meta).transpose()
    }

    /// All chat metadata, most recently fetched first.
    pub fn list_chat_meta(&self) -> Result<Vec<ChatMeta>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, last_seq, last_fetched, message_count
             FROM chat_meta
             ORDER BY last_fetched DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row_to_meta(row?)?);
        }
        Ok(out)
    }

    /// Record a network refresh. `last_seq` only moves forward.
    pub fn touch_chat(&self, chat_id: &ChatId, last_seq: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chat_meta (chat_id, last_seq, last_fetched, message_count)
             VALUES (?1, ?2, ?3, (SELECT COUNT(*) FROM messages WHERE chat_id = ?1))
             ON CONFLICT(chat_id) DO UPDATE SET
                last_seq = MAX(chat_meta.last_seq, excluded.last_seq),
                last_fetched = excluded.last_fetched,
                message_count = excluded.message_count",
            params![
                chat_id.to_string(),
                last_seq as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Drop a chat and all of its cached messages.
    pub fn delete_chat(&mut self, chat_id: &ChatId) -> Result<u64> {
        let key = chat_id.to_string();
        let tx = self.conn_mut().transaction()?;
        let removed = tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![key])?;
        tx.execute("DELETE FROM chat_meta WHERE chat_id = ?1", params![key])?;
        tx.commit()?;
        Ok(removed as u64)
    }
}

fn row_to_meta((chat_id, last_seq, last_fetched, count): (String, i64, i64, i64)) -> Result<ChatMeta> {
    Ok(ChatMeta {
        chat_id: chat_id.parse()?,
        last_seq: last_seq.max(0) as u64,
        last_fetched: millis_to_datetime(last_fetched),
        message_count: count.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::tests::message;

    #[test]
    fn touch_never_lowers_last_seq() {
        let db = Database::open_in_memory().unwrap();
        let chat: ChatId = "g:team".parse().unwrap();
        db.touch_chat(&chat, 40).unwrap();
        db.touch_chat(&chat, 12).unwrap();
        assert_eq!(db.get_chat_meta(&chat).unwrap().unwrap().last_seq, 40);
    }

    #[test]
    fn delete_chat_removes_rows_and_meta() {
        let mut db = Database::open_in_memory().unwrap();
        let chat: ChatId = "g:team".parse().unwrap();
        db.save_messages(&[message("g:team", 1), message("g:team", 2), message("g:other", 1)])
            .unwrap();
        assert_eq!(db.list_chat_meta().unwrap().len(), 2);

        assert_eq!(db.delete_chat(&chat).unwrap(), 2);
        assert!(db.get_chat_meta(&chat).unwrap().is_none());
        assert_eq!(db.count_messages(None).unwrap(), 1);
    }
}
