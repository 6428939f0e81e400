//! Default index mapping.
//!
//! `todos` stores every record field; `todos_fts` is an external-content
//! FTS5 table over title, description and tags, kept in sync by triggers.
//! Tags are stored as a JSON array, which the tokenizer splits into words.

use rusqlite::Connection;

/// Written to `PRAGMA user_version` when the index is created.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS todos (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    title       TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    completed   INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
    due_date    TEXT,
    priority    TEXT,
    tags        TEXT NOT NULL DEFAULT '[]',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_todos_user ON todos(user_id);

CREATE VIRTUAL TABLE IF NOT EXISTS todos_fts USING fts5(
    title,
    description,
    tags,
    content='todos',
    content_rowid='rowid',
    tokenize='porter unicode61',
    prefix='2 3'
);

CREATE TRIGGER IF NOT EXISTS todos_ai
AFTER INSERT ON todos
BEGIN
    INSERT INTO todos_fts(rowid, title, description, tags)
    VALUES (new.rowid, new.title, new.description, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS todos_au
AFTER UPDATE ON todos
BEGIN
    INSERT INTO todos_fts(todos_fts, rowid, title, description, tags)
    VALUES ('delete', old.rowid, old.title, old.description, old.tags);

    INSERT INTO todos_fts(rowid, title, description, tags)
    VALUES (new.rowid, new.title, new.description, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS todos_ad
AFTER DELETE ON todos
BEGIN
    INSERT INTO todos_fts(todos_fts, rowid, title, description, tags)
    VALUES ('delete', old.rowid, old.title, old.description, old.tags);
END;
"#;

/// Apply the mapping if the index has none yet. Returns `true` when it was
/// created by this call.
pub fn ensure(conn: &Connection) -> rusqlite::Result<bool> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(false);
    }

    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(true)
}
