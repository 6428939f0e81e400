//! Infrastructure layer: broker, projection stores, worker loop, config.

pub mod config;
pub mod event_bus;
pub mod read_model;
pub mod search_index;
pub mod workers;
