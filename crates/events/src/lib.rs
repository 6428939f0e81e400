//! Todo domain events and the mechanics for applying them to a projection.
//!
//! Pure mechanics only: transport and storage adapters live in
//! `todo-projector-infra`.

pub mod broker;
pub mod delivery;
pub mod dispatcher;
pub mod event;
pub mod in_memory_broker;
pub mod store;

pub use broker::{BrokerError, MessageSource};
pub use delivery::Delivery;
pub use dispatcher::{DispatchError, DispatchOutcome, EventDispatcher};
pub use event::{
    DecodeError, Decoded, EventHeader, EventKind, TodoCreated, TodoDeleted, TodoEvent, TodoUpdated,
    decode, decode_header,
};
pub use in_memory_broker::{DeadLetter, InMemoryBroker};
pub use store::{ProjectionMedium, ProjectionSession, ProjectionStore, StoreError};
