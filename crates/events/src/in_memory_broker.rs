//! In-memory durable subscription for tests/dev.
//!
//! Models the parts of a real broker the projection worker relies on:
//! pending-until-acked messages, a visibility timeout after which unacked
//! messages are handed out again with a higher delivery count, and a
//! dead-letter list. Clones share the same state, so a test can publish and
//! inspect while a worker consumes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::broker::{BrokerError, MessageSource};
use crate::Delivery;

/// A message parked on the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub reason: String,
}

#[derive(Debug)]
struct Pending {
    payload: Vec<u8>,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    ready: VecDeque<(u64, Vec<u8>)>,
    pending: BTreeMap<u64, Pending>,
    acked: Vec<String>,
    dead_letters: Vec<DeadLetter>,
    fetches: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    published: Condvar,
    visibility_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

/// Redelivery is polled at this granularity while a fetch waits.
const REDELIVERY_POLL: Duration = Duration::from_millis(5);

fn message_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_seq: 1,
                    ..State::default()
                }),
                published: Condvar::new(),
                visibility_timeout,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message to the stream; returns its id.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push_back((seq, payload.into()));
        drop(state);

        self.shared.published.notify_all();
        message_id(seq)
    }

    /// Ids acknowledged so far, in acknowledgment order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Messages handed out but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Messages never handed out.
    pub fn ready_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// Number of `fetch` calls served.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches
    }

    fn take_batch(&self, state: &mut State, max: usize) -> Vec<Delivery> {
        let mut batch = Vec::new();

        let now = Instant::now();
        for (seq, pending) in state.pending.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if now.duration_since(pending.delivered_at) >= self.shared.visibility_timeout {
                pending.delivered_at = now;
                pending.delivery_count += 1;
                batch.push(Delivery::new(
                    message_id(*seq),
                    pending.payload.clone(),
                    pending.delivery_count,
                ));
            }
        }

        while batch.len() < max {
            let Some((seq, payload)) = state.ready.pop_front() else {
                break;
            };
            batch.push(Delivery::new(message_id(seq), payload.clone(), 1));
            state.pending.insert(
                seq,
                Pending {
                    payload,
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }

        batch
    }

}

/// Remove a delivery from the pending set. Settling twice is a no-op.
fn settle(state: &mut State, delivery: &Delivery) -> bool {
    let Some(seq) = parse_seq(delivery.id()) else {
        return false;
    };
    let removed = state.pending.remove(&seq).is_some();
    if removed {
        state.acked.push(delivery.id().to_string());
    }
    removed
}

impl MessageSource for InMemoryBroker {
    fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();
        state.fetches += 1;

        loop {
            let batch = self.take_batch(&mut state, max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let slice = (deadline - now).min(REDELIVERY_POLL);
            state = self
                .shared
                .published
                .wait_timeout(state, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        settle(&mut self.lock(), delivery);
        Ok(())
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !settle(&mut state, delivery) {
            return Ok(());
        }
        state.dead_letters.push(DeadLetter {
            message_id: delivery.id().to_string(),
            payload: delivery.payload().to_vec(),
            delivery_count: delivery.delivery_count(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
