//! Row-count bounds for the cache.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::{PrunePolicy, PruneReport};

impl Database {
    /// Enforce both bounds of `policy` unconditionally.
    pub fn prune(&mut self, policy: &PrunePolicy) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let tx = self.conn_mut().transaction()?;

        // Per-chat cap: keep the `per_chat_max` highest seqs of every chat.
        let chats: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT chat_id FROM messages GROUP BY chat_id HAVING COUNT(*) > ?1",
            )?;
            let rows = stmt.query_map(params![policy.per_chat_max as i64], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for chat_id in &chats {
            let removed = tx.execute(
                "DELETE FROM messages
                 WHERE chat_id = ?1
                   AND seq <= (SELECT seq FROM messages WHERE chat_id = ?1
                               ORDER BY seq DESC LIMIT 1 OFFSET ?2)",
                params![chat_id, policy.per_chat_max as i64],
            )?;
            report.per_chat_removed += removed as u64;
        }

        // Global cap: evict the oldest rows across all chats.
        let total: i64 = tx.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let excess = total - policy.total_max as i64;
        if excess > 0 {
            let removed = tx.execute(
                "DELETE FROM messages WHERE id IN (
                    SELECT id FROM messages ORDER BY sent_at ASC, seq ASC LIMIT ?1
                 )",
                params![excess],
            )?;
            report.total_removed = removed as u64;
        }

        if report.per_chat_removed + report.total_removed > 0 {
            tx.execute(
                "UPDATE chat_meta SET message_count =
                    (SELECT COUNT(*) FROM messages WHERE messages.chat_id = chat_meta.chat_id)",
                [],
            )?;
        }
        tx.commit()?;

        if report != PruneReport::default() {
            tracing::info!(
                per_chat = report.per_chat_removed,
                total = report.total_removed,
                "pruned message cache"
            );
        }
        Ok(report)
    }

    /// Prune only when the cache has grown past the policy's slack.
    pub fn maybe_prune(&mut self, policy: &PrunePolicy) -> Result<Option<PruneReport>> {
        let total = self.count_messages(None)?;
        if total <= policy.trigger_threshold() {
            return Ok(None);
        }
        self.prune(policy).map(Some)
    }
}
