use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
    PRAGMA synchronous = NORMAL;
";

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id                       TEXT PRIMARY KEY,
        total_messages           INTEGER NOT NULL DEFAULT 0,
        total_messages_memorized INTEGER NOT NULL DEFAULT 0,
        created_at               TEXT NOT NULL,
        updated_at               TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id              TEXT PRIMARY KEY,
        user_id         TEXT NOT NULL REFERENCES users(id),
        summary         TEXT,
        max_turn        INTEGER NOT NULL DEFAULT 0,
        summarized_turn INTEGER NOT NULL DEFAULT 0,
        last_accessed   TEXT NOT NULL,
        created_at      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_user_accessed
        ON sessions(user_id, last_accessed DESC);

    CREATE TABLE IF NOT EXISTS messages (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id        TEXT NOT NULL REFERENCES sessions(id),
        user_id           TEXT NOT NULL,
        turn              INTEGER NOT NULL,
        role              TEXT NOT NULL CHECK (role IN ('user', 'model', 'function')),
        content           TEXT,
        function_name     TEXT,
        function_call     TEXT,
        function_response TEXT,
        input_tokens      INTEGER NOT NULL DEFAULT 0,
        output_tokens     INTEGER NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL,
        UNIQUE (session_id, turn, role)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_user_recency
        ON messages(user_id, id DESC);

    CREATE TABLE IF NOT EXISTS memories (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    TEXT NOT NULL REFERENCES users(id),
        key        TEXT NOT NULL,
        content    TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 1.0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, key)
    );
";

/// Apply pragmas and create tables. Safe to run on every open.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(CREATE_TABLES)?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    }
    Ok(())
}
