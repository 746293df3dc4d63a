//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `settings`, `peers`, `messages`, and
//! `files`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Settings (node GUID, display name, keypair PEM, client API key)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL                 -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Peers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS peers (
    guid       TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    name       TEXT NOT NULL,
    public_key TEXT,                         -- PKCS#1 PEM, nullable until fetched
    ip_address TEXT NOT NULL,
    port       INTEGER NOT NULL,
    last_seen  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen DESC);

-- ----------------------------------------------------------------
-- Messages
--
-- The logical message id is the primary key; the duplicate check
-- queries this same column, so at-most-once holds per node.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY NOT NULL, -- UUID v4
    sender_guid   TEXT NOT NULL,
    receiver_guid TEXT NOT NULL,             -- empty for canonical broadcasts
    type          TEXT NOT NULL,
    scope         TEXT NOT NULL DEFAULT 'private',
    content       BLOB NOT NULL,
    timestamp     TEXT NOT NULL,
    source_ip     TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp DESC);

-- ----------------------------------------------------------------
-- Files (shared-path records; content stays on disk)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_id       TEXT PRIMARY KEY NOT NULL, -- UUID v4
    sender_guid   TEXT NOT NULL,
    receiver_guid TEXT,                      -- nullable: broadcast share
    filename      TEXT NOT NULL,
    path          TEXT NOT NULL,
    size          INTEGER NOT NULL,
    mime_type     TEXT NOT NULL,
    created_at    TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
