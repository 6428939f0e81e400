//! Postgres-backed projection store.
//!
//! Writes go to a single `todo` table keyed by todo id. Every statement
//! autocommits, so a session holds no lock and closing it is free; this is
//! the medium to use when several workers share one subscription.
//!
//! The worker loop is synchronous. Each call bridges into the async `sqlx`
//! pool through a runtime [`Handle`], which must belong to a multi-threaded
//! runtime and must not be called from inside one of its tasks.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Instrument, debug, debug_span};

use todo_projector_core::{TodoFields, TodoId, TodoRecord, UserId};
use todo_projector_events::{ProjectionMedium, ProjectionSession, ProjectionStore, StoreError};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS todo (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        title       TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        completed   BOOLEAN NOT NULL DEFAULT FALSE,
        due_date    TIMESTAMPTZ,
        priority    TEXT,
        tags        TEXT[] NOT NULL DEFAULT '{}',
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
"#;

fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::backend(other),
    }
}

pub struct PostgresProjectionStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresProjectionStore {
    /// Wrap an existing pool. `handle` drives every query.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect and make sure the `todo` table exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(store_error)?;
        Self::ensure_schema(&pool).await?;
        Ok(pool)
    }

    pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn get(&self, id: &TodoId) -> Result<Option<TodoRecord>, StoreError> {
        let pool = &self.pool;
        self.handle.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT id, user_id, title, description, completed,
                       due_date, priority, tags, created_at, updated_at
                FROM todo
                WHERE id = $1
                "#,
            )
            .bind(id.as_str())
            .fetch_optional(pool)
            .await
            .map_err(store_error)?;

            let Some(row) = row else {
                return Ok(None);
            };

            let record = TodoRecord {
                id: id.clone(),
                user_id: UserId::new(row.try_get::<String, _>("user_id").map_err(store_error)?),
                fields: TodoFields {
                    title: row.try_get("title").map_err(store_error)?,
                    description: row.try_get("description").map_err(store_error)?,
                    completed: row.try_get("completed").map_err(store_error)?,
                    due_date: row.try_get("due_date").map_err(store_error)?,
                    priority: row.try_get("priority").map_err(store_error)?,
                    tags: row.try_get("tags").map_err(store_error)?,
                },
                created_at: row.try_get("created_at").map_err(store_error)?,
                updated_at: row.try_get("updated_at").map_err(store_error)?,
            };
            Ok(Some(record))
        })
    }

    fn insert(&self, record: &TodoRecord) -> Result<(), StoreError> {
        debug!(event_id = %record.id, "inserting todo");
        let f = &record.fields;

        self.handle.block_on(
            sqlx::query(
                r#"
                INSERT INTO todo (
                    id, user_id, title, description, completed,
                    due_date, priority, tags, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(record.id.as_str())
            .bind(record.user_id.as_str())
            .bind(&f.title)
            .bind(&f.description)
            .bind(f.completed)
            .bind(f.due_date)
            .bind(f.priority.as_deref())
            .bind(&f.tags)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .instrument(debug_span!("projection_write", operation = "insert_todo")),
        )
        .map_err(store_error)?;
        Ok(())
    }

    fn update(
        &self,
        id: &TodoId,
        f: &TodoFields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        debug!(event_id = %id, "updating todo");

        let result = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE todo SET
                        title = $2,
                        description = $3,
                        completed = $4,
                        due_date = $5,
                        priority = $6,
                        tags = $7,
                        updated_at = $8
                    WHERE id = $1
                    "#,
                )
                .bind(id.as_str())
                .bind(&f.title)
                .bind(&f.description)
                .bind(f.completed)
                .bind(f.due_date)
                .bind(f.priority.as_deref())
                .bind(&f.tags)
                .bind(updated_at)
                .execute(&self.pool)
                .instrument(debug_span!("projection_write", operation = "update_todo")),
            )
            .map_err(store_error)?;

        if result.rows_affected() == 0 {
            debug!(event_id = %id, "update for unknown todo ignored");
        }
        Ok(())
    }

    fn remove(&self, id: &TodoId) -> Result<(), StoreError> {
        debug!(event_id = %id, "deleting todo");
        self.handle
            .block_on(
                sqlx::query("DELETE FROM todo WHERE id = $1")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .instrument(debug_span!("projection_write", operation = "delete_todo")),
            )
            .map_err(store_error)?;
        Ok(())
    }
}

impl ProjectionMedium for PostgresProjectionStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn open(&mut self) -> Result<Box<dyn ProjectionSession + '_>, StoreError> {
        Ok(Box::new(PostgresSession { store: self }))
    }
}

struct PostgresSession<'a> {
    store: &'a PostgresProjectionStore,
}

impl ProjectionStore for PostgresSession<'_> {
    fn upsert_created(&mut self, record: &TodoRecord) -> Result<(), StoreError> {
        self.store.insert(record)
    }

    fn upsert_updated(
        &mut self,
        id: &TodoId,
        fields: &TodoFields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.update(id, fields, updated_at)
    }

    fn delete(&mut self, id: &TodoId) -> Result<(), StoreError> {
        self.store.remove(id)
    }
}

impl ProjectionSession for PostgresSession<'_> {
    fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
