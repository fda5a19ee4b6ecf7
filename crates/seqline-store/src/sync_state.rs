//! Sync watermark (`pts`) per user. Stored values never decrease.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use seqline_shared::UserId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn load_pts(&self, user_id: &UserId) -> Result<Option<u64>> {
        let pts: Option<i64> = self
            .conn()
            .query_row(
                "SELECT pts FROM sync_state WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pts.map(|p| p.max(0) as u64))
    }

    /// Store `pts` unless a higher value is already recorded. Returns the
    /// value held after the write.
    pub fn save_pts(&self, user_id: &UserId, pts: u64) -> Result<u64> {
        let stored: i64 = self.conn().query_row(
            "INSERT INTO sync_state (user_id, pts, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                pts = MAX(sync_state.pts, excluded.pts),
                updated_at = excluded.updated_at
             RETURNING pts",
            params![user_id.as_str(), pts as i64, Utc::now().timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(stored.max(0) as u64)
    }

    pub fn clear_pts(&self, user_id: &UserId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM sync_state WHERE user_id = ?1",
            params![user_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let me = UserId::from("alice");
        assert_eq!(db.load_pts(&me).unwrap(), None);

        assert_eq!(db.save_pts(&me, 10).unwrap(), 10);
        assert_eq!(db.save_pts(&me, 7).unwrap(), 10);
        assert_eq!(db.save_pts(&me, 15).unwrap(), 15);
        assert_eq!(db.load_pts(&me).unwrap(), Some(15));

        db.clear_pts(&me).unwrap();
        assert_eq!(db.load_pts(&me).unwrap(), None);
    }
}
