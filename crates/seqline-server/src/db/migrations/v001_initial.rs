//! v001 -- Counters, messages, delivery cursors, group directory, update log.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Per-chat seq counters
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_counters (
    chat_id TEXT PRIMARY KEY NOT NULL,        -- p:<low>:<high> / g:<group>
    seq     INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID
    chat_id     TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    sender_id   TEXT NOT NULL,
    kind        TEXT NOT NULL,
    content     TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',   -- JSON array
    reply_to    TEXT,
    sent_at     INTEGER NOT NULL,             -- unix millis
    edited_at   INTEGER,
    deleted_at  INTEGER,

    UNIQUE (chat_id, seq)
);

-- ----------------------------------------------------------------
-- Delivery / read cursors
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_member_state (
    chat_id            TEXT NOT NULL,
    user_id            TEXT NOT NULL,
    last_read_seq      INTEGER NOT NULL DEFAULT 0,
    last_delivered_seq INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (chat_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_member_state_read
    ON chat_member_state(chat_id, last_read_seq);

-- ----------------------------------------------------------------
-- Shared pointer for read-scaling groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_state (
    group_id        TEXT PRIMARY KEY NOT NULL,
    last_seq        INTEGER NOT NULL,
    last_message_id TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Group directory (owned by the account service, read here)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL,
    is_active  INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL DEFAULT 'member',
    status      TEXT NOT NULL DEFAULT 'active', -- active | muted | banned | left
    muted_until INTEGER,                        -- unix millis
    joined_at   INTEGER NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);

-- ----------------------------------------------------------------
-- Per-user update log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS update_counters (
    user_id TEXT PRIMARY KEY NOT NULL,
    pts     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS update_log (
    user_id    TEXT NOT NULL,
    update_id  INTEGER NOT NULL,
    kind       TEXT NOT NULL,
    chat_id    TEXT NOT NULL,
    seq        INTEGER,
    message_id TEXT,
    payload    TEXT NOT NULL DEFAULT 'null',
    dedupe_key TEXT,
    created_at INTEGER NOT NULL,

    PRIMARY KEY (user_id, update_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_update_log_dedupe
    ON update_log(user_id, dedupe_key) WHERE dedupe_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS sync_acks (
    user_id TEXT PRIMARY KEY NOT NULL,
    pts     INTEGER NOT NULL
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
