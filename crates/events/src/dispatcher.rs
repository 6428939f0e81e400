//! Routes one raw payload to the projection store.
//!
//! The dispatcher holds no projection state: every message is decoded and
//! applied on its own, and repeated application relies entirely on the
//! store's idempotent writes.

use thiserror::Error;
use tracing::{debug, warn};

use todo_projector_core::TodoId;

use crate::event::{DecodeError, Decoded, EventKind, TodoEvent, decode};
use crate::store::{ProjectionStore, StoreError};

/// What happened to a successfully handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied { kind: EventKind, id: TodoId },
    /// Unknown event type; nothing was written.
    Ignored { event_type: String, id: TodoId },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload cannot be decoded. Redelivery will not help.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The store rejected the write. Redelivery may succeed.
    #[error("{kind} for {id} not applied: {source}")]
    Store {
        kind: EventKind,
        id: TodoId,
        #[source]
        source: StoreError,
    },
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EventDispatcher;

impl EventDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Decode `payload` and apply it to `store`.
    ///
    /// - Created → `upsert_created` with `completed = false` and both
    ///   timestamps set to the event time
    /// - Updated → `upsert_updated` with the event time as `updated_at`
    /// - Deleted → `delete`
    /// - unknown type → [`DispatchOutcome::Ignored`]
    pub fn dispatch<S>(
        &self,
        payload: &[u8],
        store: &mut S,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        S: ProjectionStore + ?Sized,
    {
        let event = match decode(payload)? {
            Decoded::Event(event) => event,
            Decoded::Unknown(header) => {
                warn!(
                    event_type = %header.event_type,
                    event_id = %header.id,
                    "unknown event type, skipping"
                );
                return Ok(DispatchOutcome::Ignored {
                    event_type: header.event_type,
                    id: header.id,
                });
            }
        };

        let kind = event.kind();
        let id = event.id().clone();
        debug!(event_type = %kind, event_id = %id, "event received");

        let result = match event {
            TodoEvent::Created(ev) => store.upsert_created(&ev.into_record()),
            TodoEvent::Updated(ev) => store.upsert_updated(&ev.id, &ev.fields, ev.occurred_at),
            TodoEvent::Deleted(ev) => store.delete(&ev.id),
        };

        match result {
            Ok(()) => {
                debug!(event_type = %kind, event_id = %id, "event applied");
                Ok(DispatchOutcome::Applied { kind, id })
            }
            Err(source) => Err(DispatchError::Store { kind, id, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use todo_projector_core::{TodoFields, TodoRecord};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Created(TodoRecord),
        Updated(TodoId, TodoFields, DateTime<Utc>),
        Deleted(TodoId),
    }

    /// Records every call; optionally fails all writes.
    #[derive(Default)]
    struct RecordingStore {
        calls: Vec<Call>,
        fail: bool,
    }

    impl RecordingStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.fail {
                Err(StoreError::Unavailable("test store down".into()))
            } else {
                Ok(())
            }
        }
    }

    impl ProjectionStore for RecordingStore {
        fn upsert_created(&mut self, record: &TodoRecord) -> Result<(), StoreError> {
            self.check()?;
            self.calls.push(Call::Created(record.clone()));
            Ok(())
        }

        fn upsert_updated(
            &mut self,
            id: &TodoId,
            fields: &TodoFields,
            updated_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.calls.push(Call::Updated(id.clone(), fields.clone(), updated_at));
            Ok(())
        }

        fn delete(&mut self, id: &TodoId) -> Result<(), StoreError> {
            self.check()?;
            self.calls.push(Call::Deleted(id.clone()));
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn created_event_upserts_incomplete_record() {
        let mut store = RecordingStore::default();
        let payload = br#"{"type":"TodoCreatedEvent","id":"c1","userId":"u1",
            "timestamp":"1970-01-01T00:00:01Z","title":"test","description":"desc",
            "completed":true,"tags":["tag1","tag2"]}"#;

        let outcome = EventDispatcher::new().dispatch(payload, &mut store).unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Applied {
                kind: EventKind::Created,
                id: TodoId::new("c1").unwrap()
            }
        );
        let [Call::Created(record)] = store.calls.as_slice() else {
            panic!("expected one create call, got {:?}", store.calls);
        };
        assert_eq!(record.user_id.as_str(), "u1");
        assert_eq!(record.fields.title, "test");
        assert_eq!(record.fields.tags, vec!["tag1", "tag2"]);
        assert!(!record.fields.completed);
        assert_eq!(record.created_at, at(1));
        assert_eq!(record.updated_at, at(1));
    }

    #[test]
    fn updated_event_passes_full_field_set_and_timestamp() {
        let mut store = RecordingStore::default();
        let payload = br#"{"type":"TodoUpdatedEvent","id":"c1","userId":"u1",
            "timestamp":"1970-01-01T00:00:02Z","title":"updated","description":"updated desc",
            "completed":true,"tags":["tagA"]}"#;

        EventDispatcher::new().dispatch(payload, &mut store).unwrap();

        let expected = TodoFields {
            title: "updated".into(),
            description: "updated desc".into(),
            completed: true,
            due_date: None,
            priority: None,
            tags: vec!["tagA".into()],
        };
        assert_eq!(
            store.calls,
            vec![Call::Updated(TodoId::new("c1").unwrap(), expected, at(2))]
        );
    }

    #[test]
    fn deleted_event_deletes_by_id() {
        let mut store = RecordingStore::default();
        EventDispatcher::new()
            .dispatch(br#"{"type":"TodoDeletedEvent","id":"d1"}"#, &mut store)
            .unwrap();
        assert_eq!(store.calls, vec![Call::Deleted(TodoId::new("d1").unwrap())]);
    }

    #[test]
    fn unknown_event_leaves_store_untouched() {
        let mut store = RecordingStore::default();
        let outcome = EventDispatcher::new()
            .dispatch(br#"{"type":"Foo","id":"z"}"#, &mut store)
            .unwrap();

        assert!(matches!(
            outcome,
            DispatchOutcome::Ignored { ref event_type, .. } if event_type == "Foo"
        ));
        assert!(store.calls.is_empty());
    }

    #[test]
    fn decode_failure_is_terminal() {
        let mut store = RecordingStore::default();
        let err = EventDispatcher::new()
            .dispatch(b"definitely not json", &mut store)
            .unwrap_err();

        assert!(matches!(err, DispatchError::Decode(_)));
        assert!(!err.is_retryable());
        assert!(store.calls.is_empty());
    }

    #[test]
    fn store_failure_is_retryable() {
        let mut store = RecordingStore {
            fail: true,
            ..RecordingStore::default()
        };
        let err = EventDispatcher::new()
            .dispatch(br#"{"type":"TodoDeletedEvent","id":"d1"}"#, &mut store)
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(err, DispatchError::Store { kind: EventKind::Deleted, .. }));
    }
}
