//! Projection store implementations.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryProjectionStore;
pub use postgres::PostgresProjectionStore;
