//! Embedded full-text search index (single writer).
//!
//! The index is one SQLite file guarded by an exclusive advisory lock on a
//! sibling `<index>.lock` file. A [`ProjectionMedium::open`] call acquires the
//! lock, opens the index (creating it with the default mapping when absent)
//! and begins a write transaction; closing the session commits and releases
//! the lock. A session that is dropped instead rolls back and still releases
//! the lock, so an unwinding batch never leaves the index held.

pub mod lock;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use todo_projector_core::{TodoFields, TodoId, TodoRecord, UserId};
use todo_projector_events::{ProjectionMedium, ProjectionSession, ProjectionStore, StoreError};

pub use lock::{IndexLock, lock_path_for};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn sql_error(err: rusqlite::Error) -> StoreError {
    StoreError::backend(err)
}

fn to_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn from_text(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

#[derive(Debug, Clone)]
pub struct SearchIndex {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl SearchIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock_path: lock_path_for(&path),
            path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open_read_only(&self) -> Result<Connection, StoreError> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(sql_error)
    }

    /// Stored record for `id`. Reads do not take the writer lock.
    pub fn get(&self, id: &TodoId) -> Result<Option<TodoRecord>, StoreError> {
        if !self.exists() {
            return Ok(None);
        }
        let conn = self.open_read_only()?;
        conn.query_row(
            "SELECT user_id, title, description, completed, due_date, priority, tags,
                    created_at, updated_at
             FROM todos WHERE id = ?1",
            [id.as_str()],
            |row| {
                let tags: String = row.get(6)?;
                let tags = serde_json::from_str(&tags).map_err(|e| conversion_error(6, e))?;
                let due_date = match row.get::<_, Option<String>>(4)? {
                    Some(raw) => Some(from_text(4, &raw)?),
                    None => None,
                };
                Ok(TodoRecord {
                    id: id.clone(),
                    user_id: UserId::new(row.get::<_, String>(0)?),
                    fields: TodoFields {
                        title: row.get(1)?,
                        description: row.get(2)?,
                        completed: row.get(3)?,
                        due_date,
                        priority: row.get(5)?,
                        tags,
                    },
                    created_at: from_text(7, &row.get::<_, String>(7)?)?,
                    updated_at: from_text(8, &row.get::<_, String>(8)?)?,
                })
            },
        )
        .optional()
        .map_err(sql_error)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64, StoreError> {
        if !self.exists() {
            return Ok(0);
        }
        let conn = self.open_read_only()?;
        let n: i64 = conn
            .query_row("SELECT count(*) FROM todos", [], |row| row.get(0))
            .map_err(sql_error)?;
        Ok(n.max(0) as u64)
    }

    /// Ids matching an FTS5 query over title, description and tags, best
    /// match first.
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<TodoId>, StoreError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let conn = self.open_read_only()?;
        let mut stmt = conn
            .prepare(
                "SELECT t.id FROM todos_fts f
                 JOIN todos t ON t.rowid = f.rowid
                 WHERE todos_fts MATCH ?1
                 ORDER BY bm25(todos_fts)
                 LIMIT ?2",
            )
            .map_err(sql_error)?;

        let ids = stmt
            .query_map(params![query, limit], |row| row.get::<_, String>(0))
            .map_err(sql_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_error)?;

        ids.into_iter()
            .map(|id| TodoId::new(id).map_err(StoreError::backend))
            .collect()
    }
}

impl ProjectionMedium for SearchIndex {
    fn name(&self) -> &'static str {
        "search-index"
    }

    fn open(&mut self) -> Result<Box<dyn ProjectionSession + '_>, StoreError> {
        let lock = IndexLock::acquire(&self.lock_path, self.lock_timeout)?;

        let conn = Connection::open(&self.path).map_err(sql_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_error)?;

        let created = schema::ensure(&conn).map_err(sql_error)?;
        if created {
            info!(path = %self.path.display(), "created new index");
        } else {
            debug!(path = %self.path.display(), "opened existing index");
        }

        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_error)?;

        Ok(Box::new(IndexSession {
            conn,
            _lock: lock,
            finished: false,
        }))
    }
}

/// Field order matters: the connection closes before the lock is released.
struct IndexSession {
    conn: Connection,
    _lock: IndexLock,
    finished: bool,
}

impl ProjectionStore for IndexSession {
    fn upsert_created(&mut self, record: &TodoRecord) -> Result<(), StoreError> {
        let f = &record.fields;
        let tags = serde_json::to_string(&f.tags).map_err(StoreError::backend)?;

        self.conn
            .execute(
                "INSERT INTO todos (
                     id, user_id, title, description, completed,
                     due_date, priority, tags, created_at, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (id) DO NOTHING",
                params![
                    record.id.as_str(),
                    record.user_id.as_str(),
                    f.title,
                    f.description,
                    f.completed,
                    f.due_date.map(to_text),
                    f.priority,
                    tags,
                    to_text(record.created_at),
                    to_text(record.updated_at),
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }

    fn upsert_updated(
        &mut self,
        id: &TodoId,
        fields: &TodoFields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&fields.tags).map_err(StoreError::backend)?;

        let changed = self
            .conn
            .execute(
                "UPDATE todos SET
                     title = ?2,
                     description = ?3,
                     completed = ?4,
                     due_date = ?5,
                     priority = ?6,
                     tags = ?7,
                     updated_at = ?8
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    fields.title,
                    fields.description,
                    fields.completed,
                    fields.due_date.map(to_text),
                    fields.priority,
                    tags,
                    to_text(updated_at),
                ],
            )
            .map_err(sql_error)?;

        if changed == 0 {
            debug!(event_id = %id, "update for unknown todo ignored");
        }
        Ok(())
    }

    fn delete(&mut self, id: &TodoId) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM todos WHERE id = ?1", [id.as_str()])
            .map_err(sql_error)?;
        Ok(())
    }
}

impl ProjectionSession for IndexSession {
    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(sql_error(err));
        }
        Ok(())
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback of abandoned index session failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn id(s: &str) -> TodoId {
        TodoId::new(s).unwrap()
    }

    fn index() -> (tempfile::TempDir, SearchIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = SearchIndex::new(dir.path().join("todos.db"))
            .with_lock_timeout(Duration::from_millis(50));
        (dir, index)
    }

    fn created(s: &str, title: &str) -> TodoRecord {
        TodoRecord::created(
            id(s),
            UserId::from("u1"),
            TodoFields {
                title: title.into(),
                description: "desc".into(),
                due_date: Some(at(86_400)),
                priority: Some("high".into()),
                tags: vec!["tag1".into(), "tag2".into()],
                ..TodoFields::default()
            },
            at(1),
        )
    }

    #[test]
    fn open_creates_index_and_lock_files() {
        let (_dir, mut index) = index();
        assert!(!index.exists());

        index.open().unwrap().close().unwrap();

        assert!(index.exists());
        assert!(index.lock_path().exists());
        assert_eq!(index.count().unwrap(), 0);
    }

    #[test]
    fn committed_record_round_trips_all_fields() {
        let (_dir, mut index) = index();
        let record = created("a", "buy milk");

        let mut session = index.open().unwrap();
        session.upsert_created(&record).unwrap();
        session.close().unwrap();

        assert_eq!(index.get(&id("a")).unwrap(), Some(record));
    }

    #[test]
    fn create_twice_keeps_first_and_update_overwrites() {
        let (_dir, mut index) = index();

        let mut session = index.open().unwrap();
        session.upsert_created(&created("a", "first")).unwrap();
        session.upsert_created(&created("a", "second")).unwrap();
        let fields = TodoFields {
            title: "updated".into(),
            completed: true,
            tags: vec!["tagA".into()],
            ..TodoFields::default()
        };
        session.upsert_updated(&id("a"), &fields, at(2)).unwrap();
        session.upsert_updated(&id("ghost"), &fields, at(2)).unwrap();
        session.close().unwrap();

        let rec = index.get(&id("a")).unwrap().unwrap();
        assert_eq!(rec.fields, fields);
        assert_eq!(rec.created_at, at(1));
        assert_eq!(rec.updated_at, at(2));
        assert_eq!(index.count().unwrap(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, mut index) = index();
        let mut session = index.open().unwrap();
        session.upsert_created(&created("a", "x")).unwrap();
        session.delete(&id("a")).unwrap();
        session.delete(&id("a")).unwrap();
        session.delete(&id("never")).unwrap();
        session.close().unwrap();

        assert_eq!(index.get(&id("a")).unwrap(), None);
    }

    #[test]
    fn dropped_session_rolls_back_and_releases_lock() {
        let (_dir, mut index) = index();
        {
            let mut session = index.open().unwrap();
            session.upsert_created(&created("a", "discarded")).unwrap();
        }
        assert_eq!(index.get(&id("a")).unwrap(), None);

        IndexLock::acquire(index.lock_path(), Duration::ZERO).unwrap();
    }

    #[test]
    fn open_while_locked_reports_contention() {
        let (_dir, mut index) = index();
        let _held = IndexLock::acquire(index.lock_path(), Duration::ZERO).unwrap();

        let err = index.open().err().unwrap();
        assert!(matches!(err, StoreError::LockContention { .. }));
    }

    #[test]
    fn search_matches_title_description_and_tags() {
        let (_dir, mut index) = index();
        let mut session = index.open().unwrap();
        session.upsert_created(&created("a", "buy groceries")).unwrap();
        session.upsert_created(&created("b", "walk the dog")).unwrap();
        session.close().unwrap();

        assert_eq!(index.search("groceries", 10).unwrap(), vec![id("a")]);
        assert_eq!(index.search("tag1", 10).unwrap().len(), 2);

        let mut session = index.open().unwrap();
        session.delete(&id("a")).unwrap();
        session.close().unwrap();
        assert!(index.search("groceries", 10).unwrap().is_empty());
    }
}
