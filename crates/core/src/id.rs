//! Strongly-typed identifiers used across the projection.
//!
//! Producers mint identifiers; this side only carries them, so both types
//! wrap the producer's string verbatim instead of parsing a UUID.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a todo item. Stable across the item's lifetime, never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TodoId(String);

/// Identifier of the principal owning a todo item.
///
/// Delete events may omit it, so the empty id is representable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl TodoId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("TodoId", "must not be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for TodoId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TodoId> for String {
    fn from(value: TodoId) -> Self {
        value.0
    }
}

impl FromStr for TodoId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl core::fmt::Display for TodoId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_id_rejects_empty_and_blank() {
        assert!(matches!(TodoId::new(""), Err(DomainError::InvalidId { .. })));
        assert!(matches!(TodoId::new("   "), Err(DomainError::InvalidId { .. })));
        assert_eq!(TodoId::new("todo-1").unwrap().as_str(), "todo-1");
    }

    #[test]
    fn todo_id_deserialization_enforces_non_empty() {
        let ok: TodoId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.to_string(), "abc");

        let err = serde_json::from_str::<TodoId>("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn user_id_round_trips_as_plain_string() {
        let user = UserId::from("u1");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"u1\"");
        assert!(UserId::default().is_empty());
    }
}
