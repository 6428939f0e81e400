//! `todo-projector-core`: projection building blocks.
//!
//! This crate contains **pure** primitives shared by the event model and the
//! projection stores (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod record;

pub use error::DomainError;
pub use id::{TodoId, UserId};
pub use record::{TodoFields, TodoRecord};
