use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use todo_projector_core::{TodoFields, TodoId, TodoRecord};
use todo_projector_events::{ProjectionMedium, ProjectionSession, ProjectionStore, StoreError};

#[derive(Debug, Default)]
struct State {
    records: HashMap<TodoId, TodoRecord>,
    opens: u64,
    commits: u64,
    rollbacks: u64,
    open_sessions: u64,
}

/// Injected failures, for exercising the worker's error paths.
#[derive(Debug, Default)]
struct Faults {
    open: bool,
    close: bool,
    all_writes: bool,
    write_ids: HashSet<TodoId>,
    panic_ids: HashSet<TodoId>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    faults: RwLock<Faults>,
}

/// In-memory projection for tests/dev.
///
/// Clones share the same records, so a test can hand one clone to a worker
/// and inspect the other. Sessions stage their writes and only publish them
/// on `close`; a dropped session discards them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionStore {
    inner: Arc<Inner>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> RwLockReadGuard<'_, Faults> {
        self.inner.faults.read().unwrap_or_else(|e| e.into_inner())
    }

    fn faults_mut(&self) -> RwLockWriteGuard<'_, Faults> {
        self.inner.faults.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &TodoId) -> Option<TodoRecord> {
        self.state().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, ordered by id.
    pub fn list(&self) -> Vec<TodoRecord> {
        let mut records: Vec<_> = self.state().records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn open_count(&self) -> u64 {
        self.state().opens
    }

    pub fn commit_count(&self) -> u64 {
        self.state().commits
    }

    pub fn rollback_count(&self) -> u64 {
        self.state().rollbacks
    }

    /// Sessions opened and not yet closed or dropped.
    pub fn open_sessions(&self) -> u64 {
        self.state().open_sessions
    }

    pub fn fail_open(&self, fail: bool) {
        self.faults_mut().open = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.faults_mut().close = fail;
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.faults_mut().all_writes = fail;
    }

    /// Every write touching `id` fails with [`StoreError::Unavailable`].
    pub fn fail_writes_for(&self, id: TodoId) {
        self.faults_mut().write_ids.insert(id);
    }

    /// Every write touching `id` panics.
    pub fn panic_on(&self, id: TodoId) {
        self.faults_mut().panic_ids.insert(id);
    }

    pub fn clear_faults(&self) {
        *self.faults_mut() = Faults::default();
    }

    fn check_write(&self, id: &TodoId) -> Result<(), StoreError> {
        let faults = self.faults();
        if faults.panic_ids.contains(id) {
            drop(faults);
            panic!("injected panic writing {id}");
        }
        if faults.all_writes || faults.write_ids.contains(id) {
            return Err(StoreError::Unavailable(format!("injected write failure for {id}")));
        }
        Ok(())
    }
}

impl ProjectionMedium for InMemoryProjectionStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn open(&mut self) -> Result<Box<dyn ProjectionSession + '_>, StoreError> {
        if self.faults().open {
            return Err(StoreError::Unavailable("injected open failure".into()));
        }

        let mut state = self.state_mut();
        state.opens += 1;
        state.open_sessions += 1;
        let staged = state.records.clone();
        drop(state);

        Ok(Box::new(InMemorySession {
            store: self.clone(),
            staged,
            finished: false,
        }))
    }
}

struct InMemorySession {
    store: InMemoryProjectionStore,
    staged: HashMap<TodoId, TodoRecord>,
    finished: bool,
}

impl ProjectionStore for InMemorySession {
    fn upsert_created(&mut self, record: &TodoRecord) -> Result<(), StoreError> {
        self.store.check_write(&record.id)?;
        self.staged
            .entry(record.id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    fn upsert_updated(
        &mut self,
        id: &TodoId,
        fields: &TodoFields,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.check_write(id)?;
        if let Some(record) = self.staged.get_mut(id) {
            record.overwrite(fields.clone(), updated_at);
        }
        Ok(())
    }

    fn delete(&mut self, id: &TodoId) -> Result<(), StoreError> {
        self.store.check_write(id)?;
        self.staged.remove(id);
        Ok(())
    }
}

impl ProjectionSession for InMemorySession {
    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finished = true;
        let fail = self.store.faults().close;

        let mut state = self.store.state_mut();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        if fail {
            state.rollbacks += 1;
            return Err(StoreError::Backend("injected commit failure".into()));
        }
        state.records = std::mem::take(&mut self.staged);
        state.commits += 1;
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.store.state_mut();
            state.open_sessions = state.open_sessions.saturating_sub(1);
            state.rollbacks += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use todo_projector_core::UserId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn id(s: &str) -> TodoId {
        TodoId::new(s).unwrap()
    }

    fn record(s: &str, title: &str, secs: i64) -> TodoRecord {
        TodoRecord::created(
            id(s),
            UserId::from("u1"),
            TodoFields {
                title: title.into(),
                ..TodoFields::default()
            },
            at(secs),
        )
    }

    #[test]
    fn writes_are_visible_only_after_close() {
        let mut store = InMemoryProjectionStore::new();
        let view = store.clone();

        let mut session = store.open().unwrap();
        session.upsert_created(&record("a", "first", 1)).unwrap();
        assert!(view.get(&id("a")).is_none());

        session.close().unwrap();
        assert_eq!(view.get(&id("a")).unwrap().fields.title, "first");
        assert_eq!(view.commit_count(), 1);
        assert_eq!(view.open_sessions(), 0);
    }

    #[test]
    fn dropped_session_discards_writes() {
        let mut store = InMemoryProjectionStore::new();
        {
            let mut session = store.open().unwrap();
            session.upsert_created(&record("a", "lost", 1)).unwrap();
        }
        assert!(store.is_empty());
        assert_eq!(store.rollback_count(), 1);
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn create_is_first_write_wins_and_update_overwrites() {
        let mut store = InMemoryProjectionStore::new();
        let mut session = store.open().unwrap();
        session.upsert_created(&record("a", "first", 1)).unwrap();
        session.upsert_created(&record("a", "second", 5)).unwrap();

        let fields = TodoFields {
            title: "changed".into(),
            completed: true,
            ..TodoFields::default()
        };
        session.upsert_updated(&id("a"), &fields, at(2)).unwrap();
        session.upsert_updated(&id("ghost"), &fields, at(2)).unwrap();
        session.close().unwrap();

        let rec = store.get(&id("a")).unwrap();
        assert_eq!(rec.fields, fields);
        assert_eq!(rec.created_at, at(1));
        assert_eq!(rec.updated_at, at(2));
        assert!(store.get(&id("ghost")).is_none());
    }

    #[test]
    fn delete_of_absent_id_succeeds() {
        let mut store = InMemoryProjectionStore::new();
        let mut session = store.open().unwrap();
        session.delete(&id("never")).unwrap();
        session.close().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn injected_faults_surface_as_store_errors() {
        let mut store = InMemoryProjectionStore::new();
        store.fail_writes_for(id("bad"));

        let mut session = store.open().unwrap();
        assert!(matches!(
            session.upsert_created(&record("bad", "x", 1)),
            Err(StoreError::Unavailable(_))
        ));
        session.upsert_created(&record("good", "y", 1)).unwrap();
        session.close().unwrap();
        assert_eq!(store.len(), 1);

        store.fail_open(true);
        assert!(store.open().is_err());
        store.clear_faults();

        store.fail_close(true);
        let mut session = store.open().unwrap();
        session.delete(&id("good")).unwrap();
        assert!(session.close().is_err());
        assert_eq!(store.len(), 1);
    }
}
