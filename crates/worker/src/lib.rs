//! Projection worker daemon: startup wiring and the metrics endpoint.

pub mod metrics;
pub mod startup;
