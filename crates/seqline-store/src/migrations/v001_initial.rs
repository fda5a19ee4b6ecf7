//! v001 -- Initial cache schema: `messages`, `chat_meta`, `sync_state`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages, one row per sequenced message
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID
    chat_id    TEXT NOT NULL,                 -- canonical chat id (p:a:b / g:id)
    seq        INTEGER NOT NULL,              -- chat-local sequence number
    sender_id  TEXT NOT NULL,
    sent_at    INTEGER NOT NULL,              -- unix millis
    revision   INTEGER NOT NULL,              -- unix millis, max(sent, edited, deleted)
    body       TEXT NOT NULL                  -- JSON-encoded message
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_chat_seq
    ON messages(chat_id, seq);

CREATE INDEX IF NOT EXISTS idx_messages_sent_at
    ON messages(sent_at);

-- ----------------------------------------------------------------
-- Per-chat metadata
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_meta (
    chat_id       TEXT PRIMARY KEY NOT NULL,
    last_seq      INTEGER NOT NULL DEFAULT 0,
    last_fetched  INTEGER NOT NULL DEFAULT 0, -- unix millis
    message_count INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Sync watermark per user
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    user_id    TEXT PRIMARY KEY NOT NULL,
    pts        INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0     -- unix millis
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
