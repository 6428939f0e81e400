//! Domain error model.

use thiserror::Error;

/// Failure to build a domain value from producer input.
///
/// Broker and storage failures belong to the infrastructure error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid {kind}: {reason}")]
    InvalidId {
        kind: &'static str,
        reason: &'static str,
    },
}

impl DomainError {
    pub fn invalid_id(kind: &'static str, reason: &'static str) -> Self {
        Self::InvalidId { kind, reason }
    }
}
