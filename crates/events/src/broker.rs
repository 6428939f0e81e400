//! Durable pull-based message consumption (mechanics only).
//!
//! A [`MessageSource`] is one consumer's handle on a durable, named
//! subscription. The consumer asks for bounded batches; every message handed
//! out stays pending until it is acknowledged, and becomes eligible for
//! redelivery once the broker's visibility timeout elapses.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a message may be delivered more than once; consumers
//!   must apply it idempotently
//! - **Ordered per fetch**: messages in one batch arrive in stream order;
//!   redelivered messages may come back after newer ones
//! - **Bounded poison**: `dead_letter` parks a message that keeps failing
//!   and removes it from the pending set
//!
//! Transport details (connection retry, TLS, auth) stay inside the
//! implementation.

use std::time::Duration;

use thiserror::Error;

use crate::Delivery;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The fetch wait elapsed without any message. Not a failure.
    #[error("fetch timed out")]
    Timeout,

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    /// The broker answered with something that is not a message.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Consumer side of a durable subscription.
pub trait MessageSource: Send {
    /// Request up to `max` messages, waiting at most `wait` for the first one.
    ///
    /// An empty batch (or [`BrokerError::Timeout`]) means nothing was
    /// available within the wait.
    fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError>;

    /// Acknowledge a message so it is never redelivered.
    fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Park a message on the dead-letter path and acknowledge it.
    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;
}

impl<S> MessageSource for Box<S>
where
    S: MessageSource + ?Sized,
{
    fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        (**self).fetch(max, wait)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery)
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        (**self).dead_letter(delivery, reason)
    }
}
