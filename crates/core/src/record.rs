//! The materialized read-side view of a todo item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{TodoId, UserId};

/// Mutable fields of a todo item.
///
/// An update replaces all of them at once; there is no field-level merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoFields {
    pub title: String,
    pub description: String,
    pub completed: bool,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    /// Display order is preserved; order carries no meaning.
    pub tags: Vec<String>,
}

/// Projection record keyed by [`TodoId`].
///
/// `created_at` is fixed by the first applied creation and never moves;
/// `updated_at` tracks the timestamp of the last applied event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoRecord {
    pub id: TodoId,
    pub user_id: UserId,
    #[serde(flatten)]
    pub fields: TodoFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoRecord {
    /// Record as materialized by a creation event: not completed, both
    /// timestamps equal to the event time.
    pub fn created(id: TodoId, user_id: UserId, mut fields: TodoFields, at: DateTime<Utc>) -> Self {
        fields.completed = false;
        Self {
            id,
            user_id,
            fields,
            created_at: at,
            updated_at: at,
        }
    }

    /// Overwrite every mutable field, leaving identity and `created_at` alone.
    pub fn overwrite(&mut self, fields: TodoFields, at: DateTime<Utc>) {
        self.fields = fields;
        self.updated_at = at;
    }
}
