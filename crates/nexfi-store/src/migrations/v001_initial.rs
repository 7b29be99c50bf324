//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table holding direct messages and their delivery
//! status.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- locally generated, UUID v4
    from_user_id TEXT NOT NULL,
    to_user_id   TEXT NOT NULL,
    content      TEXT NOT NULL DEFAULT '',
    image        TEXT,
    voice        TEXT,
    mood         TEXT,
    timestamp    TEXT NOT NULL,               -- RFC-3339, UTC, millisecond precision
    status       INTEGER NOT NULL DEFAULT 0,  -- 0 local, 1 delivered, 2 synced
    sent_by_me   INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    is_read      INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    remote_id    TEXT,                        -- backend id, set once synced

    CHECK (status IN (0, 1, 2)),
    CHECK ((status = 2) = (remote_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(from_user_id, to_user_id, timestamp);

CREATE INDEX IF NOT EXISTS idx_messages_status
    ON messages(status);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
