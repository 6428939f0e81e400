use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use todo_projector_events::{
    Delivery, DispatchError, DispatchOutcome, EventDispatcher, MessageSource, ProjectionMedium,
    ProjectionSession,
};

/// When a processed message is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Ack applied, ignored and undecodable messages. Store failures and
    /// panics stay unacked for redelivery until the delivery bound is hit,
    /// then the message is dead-lettered.
    #[default]
    FailSafe,
    /// Ack every message once dispatch was attempted. Failures are only logged.
    FailOpen,
}

/// How long one projection session stays open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexScope {
    /// One session around the whole batch.
    #[default]
    PerBatch,
    /// One session around each message.
    PerMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Maximum messages requested per fetch.
    pub batch_size: usize,
    /// How long a fetch may block waiting for the first message.
    pub fetch_wait: Duration,
    /// Pause after an empty or failed fetch.
    pub idle_backoff: Duration,
    pub ack_policy: AckPolicy,
    /// A failing message is dead-lettered on this delivery.
    pub max_deliveries: u32,
    pub index_scope: IndexScope,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            fetch_wait: Duration::from_secs(2),
            idle_backoff: Duration::from_millis(500),
            ack_policy: AckPolicy::FailSafe,
            max_deliveries: 5,
            index_scope: IndexScope::PerBatch,
        }
    }
}

impl WorkerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_index_scope(mut self, scope: IndexScope) -> Self {
        self.index_scope = scope;
        self
    }
}

/// Cumulative worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub fetched: u64,
    pub applied: u64,
    pub ignored: u64,
    pub decode_failures: u64,
    pub store_failures: u64,
    pub panics: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub left_unacked: u64,
    pub fetch_errors: u64,
    pub lifecycle_errors: u64,
    pub ack_errors: u64,
}

impl WorkerStats {
    fn absorb(&mut self, report: &BatchReport) {
        if report.fetched > 0 {
            self.batches += 1;
        }
        self.fetched += report.fetched as u64;
        self.applied += report.applied as u64;
        self.ignored += report.ignored as u64;
        self.decode_failures += report.decode_failures as u64;
        self.store_failures += report.store_failures as u64;
        self.panics += report.panics as u64;
        self.acked += report.acked as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.left_unacked += report.left_unacked as u64;
        self.fetch_errors += u64::from(report.fetch_error.is_some());
        self.lifecycle_errors += report.lifecycle_errors as u64;
        self.ack_errors += report.ack_errors as u64;
    }
}

/// Read-only view of a worker's counters, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct StatsReader(Arc<Mutex<WorkerStats>>);

impl StatsReader {
    pub fn snapshot(&self) -> WorkerStats {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock(&self) -> MutexGuard<'_, WorkerStats> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What one fetch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub applied: usize,
    pub ignored: usize,
    pub decode_failures: usize,
    pub store_failures: usize,
    pub panics: usize,
    pub acked: usize,
    pub dead_lettered: usize,
    pub left_unacked: usize,
    pub lifecycle_errors: usize,
    pub ack_errors: usize,
    /// Set when the fetch itself failed (timeouts are not failures).
    pub fetch_error: Option<String>,
}

impl BatchReport {
    /// Nothing was fetched, either because the subscription was empty or
    /// because the fetch failed.
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

/// Per-message result before settlement.
#[derive(Debug)]
enum Processed {
    /// Writes were issued and depend on the session committing.
    Applied,
    /// Nothing was written; safe to ack whatever the session does.
    NoWrite,
    Failed(String),
}

#[derive(Debug)]
struct Pending {
    delivery: Delivery,
    processed: Processed,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: StatsReader,
}

impl WorkerHandle {
    /// Stop pulling new batches, let the in-flight batch settle, and join.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("projection worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn stats_reader(&self) -> StatsReader {
        self.stats.clone()
    }
}

/// Fetch → open → apply → close → acknowledge loop over one durable
/// subscription and one projection medium.
///
/// Messages in a batch are applied strictly in fetch order. Acknowledgment
/// happens only after the session holding their writes has closed, so a
/// failed commit never acks a write that did not land.
pub struct ProjectionWorker<S, M> {
    source: S,
    medium: M,
    dispatcher: EventDispatcher,
    config: WorkerConfig,
    stats: StatsReader,
}

impl<S, M> ProjectionWorker<S, M>
where
    S: MessageSource,
    M: ProjectionMedium,
{
    pub fn new(source: S, medium: M, config: WorkerConfig) -> Self {
        Self {
            source,
            medium,
            dispatcher: EventDispatcher::new(),
            config,
            stats: StatsReader::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    pub fn stats_reader(&self) -> StatsReader {
        self.stats.clone()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    /// Run one fetch cycle.
    pub fn run_once(&mut self) -> BatchReport {
        let mut report = BatchReport::default();

        let batch = match self
            .source
            .fetch(self.config.batch_size, self.config.fetch_wait)
        {
            Ok(batch) => batch,
            Err(err) if err.is_timeout() => Vec::new(),
            Err(err) => {
                warn!(error = %err, "fetch failed");
                report.fetch_error = Some(err.to_string());
                self.stats.lock().absorb(&report);
                return report;
            }
        };

        if batch.is_empty() {
            return report;
        }

        report.fetched = batch.len();
        debug!(size = batch.len(), medium = self.medium.name(), "batch fetched");

        let settled = match self.config.index_scope {
            IndexScope::PerBatch => self.apply_batch(batch, &mut report),
            IndexScope::PerMessage => self.apply_each(batch, &mut report),
        };

        for pending in settled {
            self.settle(pending, &mut report);
        }

        self.stats.lock().absorb(&report);
        debug!(
            fetched = report.fetched,
            acked = report.acked,
            unacked = report.left_unacked,
            dead_lettered = report.dead_lettered,
            "batch settled"
        );
        report
    }

    /// Loop until `shutdown` fires or its sender is dropped.
    pub fn run(&mut self, shutdown: &mpsc::Receiver<()>) {
        info!(medium = self.medium.name(), "projection worker started");

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }

            let report = self.run_once();
            if !report.is_idle() {
                continue;
            }

            match shutdown.recv_timeout(self.config.idle_backoff) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }

        info!(medium = self.medium.name(), "projection worker stopped");
    }

    /// Spawn the loop on a named background thread.
    pub fn spawn(mut self, name: &str) -> io::Result<WorkerHandle>
    where
        S: 'static,
        M: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run(&shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn apply_batch(&mut self, batch: Vec<Delivery>, report: &mut BatchReport) -> Vec<Pending> {
        let dispatcher = self.dispatcher;
        let medium_name = self.medium.name();

        let mut session = match self.medium.open() {
            Ok(session) => session,
            Err(err) => {
                error!(
                    medium = medium_name,
                    error = %err,
                    size = batch.len(),
                    "failed to open projection, batch left unacked"
                );
                report.lifecycle_errors += 1;
                report.left_unacked += batch.len();
                return Vec::new();
            }
        };

        let mut pending: Vec<Pending> = batch
            .into_iter()
            .map(|delivery| {
                let processed = process(&dispatcher, &delivery, session.as_mut(), report);
                Pending { delivery, processed }
            })
            .collect();

        if let Err(err) = session.close() {
            error!(
                medium = medium_name,
                error = %err,
                "failed to close projection, applied writes discarded"
            );
            report.lifecycle_errors += 1;
            revoke_applied(&mut pending, &err.to_string());
        }

        pending
    }

    fn apply_each(&mut self, batch: Vec<Delivery>, report: &mut BatchReport) -> Vec<Pending> {
        let dispatcher = self.dispatcher;
        let medium_name = self.medium.name();
        let mut pending = Vec::with_capacity(batch.len());

        let mut remaining = batch.into_iter();
        for delivery in remaining.by_ref() {
            let mut session = match self.medium.open() {
                Ok(session) => session,
                Err(err) => {
                    error!(
                        medium = medium_name,
                        message_id = delivery.id(),
                        error = %err,
                        "failed to open projection, rest of batch left unacked"
                    );
                    report.lifecycle_errors += 1;
                    report.left_unacked += 1;
                    break;
                }
            };

            let processed = process(&dispatcher, &delivery, session.as_mut(), report);
            let mut entry = vec![Pending { delivery, processed }];
            if let Err(err) = session.close() {
                error!(
                    medium = medium_name,
                    error = %err,
                    "failed to close projection, write discarded"
                );
                report.lifecycle_errors += 1;
                revoke_applied(&mut entry, &err.to_string());
            }
            pending.extend(entry);
        }
        report.left_unacked += remaining.len();

        pending
    }

    fn settle(&mut self, pending: Pending, report: &mut BatchReport) {
        let Pending { delivery, processed } = pending;

        let failure = match processed {
            Processed::Applied | Processed::NoWrite => None,
            Processed::Failed(reason) => Some(reason),
        };

        let result = match (failure, self.config.ack_policy) {
            (None, _) => self.source.ack(&delivery).map(|()| report.acked += 1),
            (Some(reason), AckPolicy::FailOpen) => {
                warn!(
                    message_id = delivery.id(),
                    reason = %reason,
                    "acknowledging failed message under fail-open policy"
                );
                self.source.ack(&delivery).map(|()| report.acked += 1)
            }
            (Some(reason), AckPolicy::FailSafe) => {
                if delivery.delivery_count() >= self.config.max_deliveries {
                    warn!(
                        message_id = delivery.id(),
                        delivery_count = delivery.delivery_count(),
                        reason = %reason,
                        "delivery bound reached, dead-lettering"
                    );
                    self.source
                        .dead_letter(&delivery, &reason)
                        .map(|()| report.dead_lettered += 1)
                } else {
                    debug!(
                        message_id = delivery.id(),
                        delivery_count = delivery.delivery_count(),
                        "leaving failed message for redelivery"
                    );
                    report.left_unacked += 1;
                    Ok(())
                }
            }
        };

        if let Err(err) = result {
            warn!(message_id = delivery.id(), error = %err, "failed to settle message");
            report.ack_errors += 1;
        }
    }
}

/// Dispatch one message into an open session, isolating panics.
fn process(
    dispatcher: &EventDispatcher,
    delivery: &Delivery,
    session: &mut (dyn ProjectionSession + '_),
    report: &mut BatchReport,
) -> Processed {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatcher.dispatch(delivery.payload(), &mut *session)
    }));

    match outcome {
        Ok(Ok(DispatchOutcome::Applied { .. })) => {
            report.applied += 1;
            Processed::Applied
        }
        Ok(Ok(DispatchOutcome::Ignored { .. })) => {
            report.ignored += 1;
            Processed::NoWrite
        }
        Ok(Err(DispatchError::Decode(err))) => {
            warn!(message_id = delivery.id(), error = %err, "dropping undecodable message");
            report.decode_failures += 1;
            Processed::NoWrite
        }
        Ok(Err(err)) => {
            warn!(
                message_id = delivery.id(),
                delivery_count = delivery.delivery_count(),
                error = %err,
                "projection write failed"
            );
            report.store_failures += 1;
            Processed::Failed(err.to_string())
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(message_id = delivery.id(), panic = %reason, "message processing panicked");
            report.panics += 1;
            Processed::Failed(format!("panic: {reason}"))
        }
    }
}

/// A failed close discards every write of the session.
fn revoke_applied(pending: &mut [Pending], reason: &str) {
    for entry in pending.iter_mut() {
        if matches!(entry.processed, Processed::Applied) {
            entry.processed = Processed::Failed(format!("session close failed: {reason}"));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
