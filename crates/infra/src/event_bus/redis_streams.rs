//! Redis Streams-backed message source (durable, at-least-once delivery).
//!
//! - **Stream key**: `todo.events` by default; each entry carries the raw
//!   event JSON in its `payload` field
//! - **Consumer group**: `projection-worker`, created on first use and kept
//!   across restarts, so consumption resumes from the last unacked entry
//! - **Visibility timeout**: pending entries idle longer than this are
//!   claimed again by whichever consumer fetches next
//! - **Dead-letter stream**: `<stream>:dlq`, written by a script that acks
//!   the entry and appends it in one step, so a retried dead-letter call
//!   never appends twice
//!
//! The connection is opened lazily and dropped on I/O failure; the next call
//! reconnects.

use std::time::Duration;

use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::{Connection, RedisError, Value};
use tracing::{debug, info, instrument, warn};

use todo_projector_events::{BrokerError, Delivery, MessageSource};

use crate::config::BrokerSettings;

const PAYLOAD_FIELD: &str = "payload";

/// KEYS: stream, dlq. ARGV: group, id, delivery_count, reason, failed_at, payload.
///
/// Appends only when the ack removed the entry from the pending list.
const DEAD_LETTER_SCRIPT: &str = r#"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 1 then
  redis.call('XADD', KEYS[2], '*',
    'original_message_id', ARGV[2],
    'delivery_count', ARGV[3],
    'reason', ARGV[4],
    'failed_at', ARGV[5],
    'payload', ARGV[6])
end
return acked
"#;

fn redis_error(err: RedisError) -> BrokerError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

pub struct RedisStreamsSource {
    client: redis::Client,
    conn: Option<Connection>,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisStreamsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsSource")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl RedisStreamsSource {
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let stream_key = stream_key.into();

        Ok(Self {
            client,
            conn: None,
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: group.into(),
            consumer: consumer.into(),
            visibility_timeout,
        })
    }

    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        Self::new(
            &settings.url,
            &settings.stream,
            &settings.consumer_group,
            &settings.consumer_name,
            settings.visibility_timeout,
        )
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    /// Connect and create the consumer group if needed. Called at startup
    /// so an unreachable broker fails fast.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.ensure_group()?;
        info!(
            stream = %self.stream_key,
            group = %self.group,
            consumer = %self.consumer,
            "subscribed to stream"
        );
        Ok(())
    }

    /// Append a raw event to the stream. Returns the entry id.
    pub fn publish(&mut self, payload: &[u8]) -> Result<String, BrokerError> {
        let stream_key = self.stream_key.clone();
        self.with_conn(|conn| {
            redis::cmd("XADD")
                .arg(&stream_key)
                .arg("*")
                .arg(PAYLOAD_FIELD)
                .arg(payload)
                .query(conn)
        })
    }

    fn with_conn<T>(
        &mut self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, BrokerError> {
        if self.conn.is_none() {
            let conn = self
                .client
                .get_connection()
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(BrokerError::Connection("no connection".into()));
        };

        f(conn).map_err(|err| {
            let mapped = redis_error(err);
            if matches!(mapped, BrokerError::Connection(_)) {
                self.conn = None;
            }
            mapped
        })
    }

    /// `XGROUP CREATE ... MKSTREAM`, ignoring an existing group.
    fn ensure_group(&mut self) -> Result<(), BrokerError> {
        let (stream_key, group) = (self.stream_key.clone(), self.group.clone());
        let created = self.with_conn(|conn| {
            let result: redis::RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&stream_key)
                .arg(&group)
                .arg("0")
                .arg("MKSTREAM")
                .query(conn);
            match result {
                Err(err) if err.code() == Some("BUSYGROUP") => Ok(false),
                other => other.map(|()| true),
            }
        })?;

        if created {
            info!(stream = %self.stream_key, group = %self.group, "created consumer group");
        }
        Ok(())
    }

    /// Claim entries left pending past the visibility timeout.
    fn reclaim(&mut self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let min_idle = self.visibility_timeout.as_millis().to_string();
        let (stream_key, group, consumer) =
            (self.stream_key.clone(), self.group.clone(), self.consumer.clone());

        let pending: StreamPendingCountReply = self.with_conn(|conn| {
            redis::cmd("XPENDING")
                .arg(&stream_key)
                .arg(&group)
                .arg("IDLE")
                .arg(&min_idle)
                .arg("-")
                .arg("+")
                .arg(max)
                .query(conn)
        })?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.ids.iter().map(|p| p.id.clone()).collect();
        let claimed: StreamClaimReply = self.with_conn(|conn| {
            redis::cmd("XCLAIM")
                .arg(&stream_key)
                .arg(&group)
                .arg(&consumer)
                .arg(&min_idle)
                .arg(&ids)
                .query(conn)
        })?;

        let mut deliveries = Vec::with_capacity(claimed.ids.len());
        for entry in claimed.ids {
            // XCLAIM bumps the delivery counter of each claimed entry.
            let times_delivered = pending
                .ids
                .iter()
                .find(|p| p.id == entry.id)
                .map_or(1, |p| p.times_delivered);
            let count = u32::try_from(times_delivered).unwrap_or(u32::MAX).saturating_add(1);
            if let Some(delivery) = self.to_delivery(entry, count) {
                deliveries.push(delivery);
            }
        }

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "reclaimed pending entries");
        }
        Ok(deliveries)
    }

    fn read_new(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let (stream_key, group, consumer) =
            (self.stream_key.clone(), self.group.clone(), self.consumer.clone());

        let reply: Option<StreamReadReply> = self.with_conn(|conn| {
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP").arg(&group).arg(&consumer).arg("COUNT").arg(max);
            // BLOCK 0 would wait forever.
            if !wait.is_zero() {
                cmd.arg("BLOCK").arg(wait.as_millis().max(1).to_string());
            }
            cmd.arg("STREAMS").arg(&stream_key).arg(">").query(conn)
        })?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                if let Some(delivery) = self.to_delivery(entry, 1) {
                    deliveries.push(delivery);
                }
            }
        }
        Ok(deliveries)
    }

    /// Entries without a usable payload are dead-lettered straight away so
    /// they do not sit in the pending list.
    fn to_delivery(&mut self, entry: StreamId, delivery_count: u32) -> Option<Delivery> {
        match entry.map.get(PAYLOAD_FIELD) {
            Some(Value::Data(bytes)) => {
                Some(Delivery::new(entry.id, bytes.clone(), delivery_count))
            }
            Some(Value::Status(text)) => {
                Some(Delivery::new(entry.id, text.clone().into_bytes(), delivery_count))
            }
            _ => {
                warn!(message_id = %entry.id, "stream entry has no payload field");
                let empty = Delivery::new(entry.id, Vec::new(), delivery_count);
                if let Err(err) = self.dead_letter(&empty, "missing payload field") {
                    warn!(
                        message_id = empty.id(),
                        error = %err,
                        "failed to dead-letter entry without payload"
                    );
                }
                None
            }
        }
    }
}

impl MessageSource for RedisStreamsSource {
    fn fetch(&mut self, max: usize, wait: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let reclaimed = self.reclaim(max)?;
        if reclaimed.len() >= max {
            return Ok(reclaimed);
        }
        let wait = if reclaimed.is_empty() { wait } else { Duration::ZERO };
        let fresh = self.read_new(max - reclaimed.len(), wait);
        merge_reclaimed(reclaimed, fresh)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let (stream_key, group) = (self.stream_key.clone(), self.group.clone());
        let _: u64 = self.with_conn(|conn| {
            redis::cmd("XACK")
                .arg(&stream_key)
                .arg(&group)
                .arg(delivery.id())
                .query(conn)
        })?;
        Ok(())
    }

    #[instrument(
        skip(self, delivery),
        fields(message_id = %delivery.id(), delivery_count = delivery.delivery_count())
    )]
    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        let script = redis::Script::new(DEAD_LETTER_SCRIPT);
        let (stream_key, dlq_key, group) =
            (self.stream_key.clone(), self.dlq_key.clone(), self.group.clone());
        let acked: i64 = self.with_conn(|conn| {
            script
                .key(&stream_key)
                .key(&dlq_key)
                .arg(&group)
                .arg(delivery.id())
                .arg(delivery.delivery_count())
                .arg(reason)
                .arg(chrono::Utc::now().to_rfc3339())
                .arg(delivery.payload())
                .invoke(conn)
        })?;

        if acked == 0 {
            debug!("entry no longer pending, dead-letter skipped");
        } else {
            warn!(dlq = %self.dlq_key, reason, "message sent to dead-letter stream");
        }
        Ok(())
    }
}

/// Combine reclaimed entries with the result of the follow-up read.
///
/// `XCLAIM` already bumped the counters of the reclaimed entries and reset
/// their idle time, so a failed read must not discard them: they would sit
/// invisible for another visibility timeout without being processed.
fn merge_reclaimed(
    mut reclaimed: Vec<Delivery>,
    fresh: Result<Vec<Delivery>, BrokerError>,
) -> Result<Vec<Delivery>, BrokerError> {
    match fresh {
        Ok(fresh) => {
            reclaimed.extend(fresh);
            Ok(reclaimed)
        }
        Err(err) if !reclaimed.is_empty() => {
            warn!(
                error = %err,
                reclaimed = reclaimed.len(),
                "reading new entries failed, returning reclaimed entries only"
            );
            Ok(reclaimed)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    //! Live tests run with
    //! `TEST_REDIS_URL=redis://... cargo test --features redis -- --ignored`.

    use super::*;

    fn delivery(id: &str, count: u32) -> Delivery {
        Delivery::new(id, b"{}".to_vec(), count)
    }

    #[test]
    fn failed_read_keeps_reclaimed_entries() {
        let reclaimed = vec![delivery("1-0", 3)];
        let merged =
            merge_reclaimed(reclaimed, Err(BrokerError::Connection("refused".into()))).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id(), "1-0");
        assert_eq!(merged[0].delivery_count(), 3);
    }

    #[test]
    fn failed_read_without_reclaimed_entries_is_an_error() {
        let merged = merge_reclaimed(Vec::new(), Err(BrokerError::Connection("refused".into())));
        assert!(matches!(merged, Err(BrokerError::Connection(_))));
    }

    #[test]
    fn reclaimed_entries_come_before_new_ones() {
        let merged =
            merge_reclaimed(vec![delivery("1-0", 2)], Ok(vec![delivery("2-0", 1)])).unwrap();
        let ids: Vec<&str> = merged.iter().map(Delivery::id).collect();
        assert_eq!(ids, ["1-0", "2-0"]);
    }

    fn source(visibility: Duration) -> RedisStreamsSource {
        let url = std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL not set");
        let stream = format!("todo.events.test.{}", uuid::Uuid::now_v7());
        let mut source =
            RedisStreamsSource::new(url, stream, "projection-worker", "test-consumer", visibility)
                .unwrap();
        source.connect().unwrap();
        source
    }

    #[test]
    #[ignore = "requires TEST_REDIS_URL"]
    fn publish_fetch_ack() {
        let mut source = source(Duration::from_secs(30));
        let id = source.publish(br#"{"type":"TodoDeletedEvent","id":"x"}"#).unwrap();

        let batch = source.fetch(5, Duration::from_millis(200)).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id(), id);
        assert_eq!(batch[0].delivery_count(), 1);
        source.ack(&batch[0]).unwrap();

        assert!(source.fetch(5, Duration::from_millis(50)).unwrap().is_empty());
    }

    #[test]
    #[ignore = "requires TEST_REDIS_URL"]
    fn unacked_entry_is_reclaimed_after_visibility_timeout() {
        let mut source = source(Duration::from_millis(100));
        let id = source.publish(b"payload").unwrap();

        let first = source.fetch(1, Duration::from_millis(200)).unwrap();
        assert_eq!(first[0].id(), id);

        std::thread::sleep(Duration::from_millis(150));
        let again = source.fetch(1, Duration::from_millis(200)).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id(), id);
        assert_eq!(again[0].delivery_count(), 2);
    }

    #[test]
    #[ignore = "requires TEST_REDIS_URL"]
    fn connect_twice_tolerates_existing_group() {
        let mut source = source(Duration::from_secs(30));
        source.connect().unwrap();
    }

    #[test]
    #[ignore = "requires TEST_REDIS_URL"]
    fn repeated_dead_letter_appends_once() {
        let mut source = source(Duration::from_secs(30));
        source.publish(b"{}").unwrap();
        let batch = source.fetch(1, Duration::from_millis(200)).unwrap();

        source.dead_letter(&batch[0], "store unavailable").unwrap();
        source.dead_letter(&batch[0], "store unavailable").unwrap();

        let dlq = source.dlq_key().to_string();
        let len: u64 = source.with_conn(|conn| redis::cmd("XLEN").arg(&dlq).query(conn)).unwrap();
        assert_eq!(len, 1);
        assert!(source.fetch(1, Duration::from_millis(50)).unwrap().is_empty());
    }
}
