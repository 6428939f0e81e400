//! Infrastructure message sources.
//!
//! The consumer abstraction lives in `todo-projector-events` as pure
//! mechanics. This module provides broker-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsSource;
