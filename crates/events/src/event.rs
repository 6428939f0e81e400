//! Todo domain events as they arrive on the wire.
//!
//! Payloads are JSON objects sharing a common header:
//!
//! ```text
//! { "type": "TodoCreatedEvent", "id": "...", "userId": "...", "timestamp": "<RFC 3339>", ... }
//! ```
//!
//! Decoding is two-phase. The header is decoded on its own first so that
//! event types this consumer does not know yet can still be classified and
//! skipped; only recognized types have their full payload decoded.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use todo_projector_core::{DomainError, TodoFields, TodoId, TodoRecord, UserId};

/// Recognized event types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const CREATED_TAG: &'static str = "TodoCreatedEvent";
    pub const UPDATED_TAG: &'static str = "TodoUpdatedEvent";
    pub const DELETED_TAG: &'static str = "TodoDeletedEvent";

    /// Classify a wire `type` tag. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            Self::CREATED_TAG => Some(Self::Created),
            Self::UPDATED_TAG => Some(Self::Updated),
            Self::DELETED_TAG => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Created => Self::CREATED_TAG,
            Self::Updated => Self::UPDATED_TAG,
            Self::Deleted => Self::DELETED_TAG,
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed {part} payload: {source}")]
    Malformed {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid event id: {0}")]
    InvalidId(#[from] DomainError),

    #[error("{kind} is missing required field `{field}`")]
    MissingField { kind: EventKind, field: &'static str },
}

/// Header fields common to every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Raw `type` tag, kept verbatim so unknown types can be reported.
    pub event_type: String,
    pub id: TodoId,
    pub user_id: UserId,
    /// Event-generation instant. Authoritative for the projection's
    /// timestamps; arrival time is never used.
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventHeader {
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_tag(&self.event_type)
    }

    fn occurred_at(&self, kind: EventKind) -> Result<DateTime<Utc>, DecodeError> {
        self.timestamp.ok_or(DecodeError::MissingField {
            kind,
            field: "timestamp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoCreated {
    pub id: TodoId,
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub tags: Vec<String>,
}

impl TodoCreated {
    /// The projection record this event materializes.
    pub fn into_record(self) -> TodoRecord {
        let fields = TodoFields {
            title: self.title,
            description: self.description,
            completed: false,
            due_date: self.due_date,
            priority: self.priority,
            tags: self.tags,
        };
        TodoRecord::created(self.id, self.user_id, fields, self.occurred_at)
    }
}

/// Full replacement of the mutable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoUpdated {
    pub id: TodoId,
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
    pub fields: TodoFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoDeleted {
    pub id: TodoId,
    pub user_id: UserId,
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoEvent {
    Created(TodoCreated),
    Updated(TodoUpdated),
    Deleted(TodoDeleted),
}

impl TodoEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::Created,
            Self::Updated(_) => EventKind::Updated,
            Self::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn id(&self) -> &TodoId {
        match self {
            Self::Created(e) => &e.id,
            Self::Updated(e) => &e.id,
            Self::Deleted(e) => &e.id,
        }
    }
}

/// Result of a full decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(TodoEvent),
    /// Well-formed header with a type tag this consumer does not handle.
    Unknown(EventHeader),
}

#[derive(Deserialize)]
struct RawHeader {
    #[serde(rename = "type")]
    event_type: String,
    id: String,
    #[serde(default, rename = "userId")]
    user_id: Option<UserId>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    priority: Option<String>,
    /// Producers may serialize an empty tag list as `null`.
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatedBody {
    title: String,
    #[serde(default)]
    description: String,
    completed: bool,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    priority: Option<String>,
    /// Producers may serialize an empty tag list as `null`.
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Decode only the common header.
pub fn decode_header(payload: &[u8]) -> Result<EventHeader, DecodeError> {
    let raw: RawHeader = serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed {
        part: "header",
        source,
    })?;

    Ok(EventHeader {
        event_type: raw.event_type,
        id: TodoId::new(raw.id)?,
        user_id: raw.user_id.unwrap_or_default(),
        timestamp: raw.timestamp,
    })
}

/// Decode the header, then the type-specific body for recognized types.
pub fn decode(payload: &[u8]) -> Result<Decoded, DecodeError> {
    let header = decode_header(payload)?;

    let Some(kind) = header.kind() else {
        return Ok(Decoded::Unknown(header));
    };

    let event = match kind {
        EventKind::Created => {
            let occurred_at = header.occurred_at(kind)?;
            let body: CreatedBody = decode_body(payload, kind)?;
            TodoEvent::Created(TodoCreated {
                id: header.id,
                user_id: header.user_id,
                occurred_at,
                title: body.title,
                description: body.description,
                due_date: body.due_date,
                priority: body.priority,
                tags: body.tags.unwrap_or_default(),
            })
        }
        EventKind::Updated => {
            let occurred_at = header.occurred_at(kind)?;
            let body: UpdatedBody = decode_body(payload, kind)?;
            TodoEvent::Updated(TodoUpdated {
                id: header.id,
                user_id: header.user_id,
                occurred_at,
                fields: TodoFields {
                    title: body.title,
                    description: body.description,
                    completed: body.completed,
                    due_date: body.due_date,
                    priority: body.priority,
                    tags: body.tags.unwrap_or_default(),
                },
            })
        }
        EventKind::Deleted => TodoEvent::Deleted(TodoDeleted {
            id: header.id,
            user_id: header.user_id,
            occurred_at: header.timestamp,
        }),
    };

    Ok(Decoded::Event(event))
}

fn decode_body<T: DeserializeOwned>(payload: &[u8], kind: EventKind) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed {
        part: kind.tag(),
        source,
    })
}
