//! Projection write contract.
//!
//! The projection is a disposable, read-optimized view of the todo event
//! stream. This module defines how events are written to it, not how it is
//! stored: implementations live in `todo-projector-infra` (embedded search
//! index, Postgres, in-memory).
//!
//! ## Idempotency
//!
//! Delivery is at-least-once, so every write must tolerate being repeated:
//!
//! - `upsert_created` is first-write-wins: an id that already exists is left
//!   untouched, which also keeps `created_at` fixed
//! - `upsert_updated` is a full overwrite, so repeating it converges; an
//!   unknown id is a no-op
//! - `delete` of an absent id succeeds
//!
//! Timestamp ordering is not enforced here. A stale update applied after a
//! newer one wins.
//!
//! ## Sessions
//!
//! Writes happen inside a [`ProjectionSession`] obtained from a
//! [`ProjectionMedium`]. For single-writer media the session is the lock
//! scope: opening acquires it, closing (or dropping) releases it.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use todo_projector_core::{TodoFields, TodoId, TodoRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("projection backend error: {0}")]
    Backend(String),

    #[error("projection i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("projection lock {} not acquired within {waited:?}", path.display())]
    LockContention { path: PathBuf, waited: Duration },

    #[error("projection store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(err: impl core::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Idempotent write capability keyed by todo id.
pub trait ProjectionStore {
    fn upsert_created(&mut self, record: &TodoRecord) -> Result<(), StoreError>;

    /// Must not touch `created_at` or `user_id`.
    fn upsert_updated(
        &mut self,
        id: &TodoId,
        fields: &TodoFields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn delete(&mut self, id: &TodoId) -> Result<(), StoreError>;
}

/// An open write scope on a projection medium.
///
/// Dropping a session without calling [`close`](Self::close) must still
/// release whatever the medium holds, discarding uncommitted writes.
pub trait ProjectionSession: ProjectionStore {
    /// Commit and release. Writes are only durable once this returns `Ok`.
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// A storage medium chosen once at startup.
pub trait ProjectionMedium: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn open(&mut self) -> Result<Box<dyn ProjectionSession + '_>, StoreError>;
}

impl<M> ProjectionMedium for Box<M>
where
    M: ProjectionMedium + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&mut self) -> Result<Box<dyn ProjectionSession + '_>, StoreError> {
        (**self).open()
    }
}
