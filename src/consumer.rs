//! Persistence worker: consumer-group tail of the message stream.
//!
//! Entries are read with XREADGROUP, coalesced into batches, and handed to
//! a [`BatchProcessor`]. Stream ids are acked only after the sink reports
//! success; a failed batch stays pending and is redelivered, so the sink
//! must tolerate duplicates (at-least-once).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stream::{MESSAGES_STREAM, PERSIST_CONSUMER_GROUP, StreamEnvelope, StreamError};

/// XREADGROUP block timeout.
const READ_BLOCK: Duration = Duration::from_millis(100);

/// Per-batch deadline for the sink call.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a read error before retrying.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Durable sink for message batches. Must be idempotent under redelivery.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: &[StreamEnvelope]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stable consumer id within the group.
    pub consumer_id: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

/// In-flight batch bookkeeping: envelopes plus their stream ids, and the
/// instant the batch was opened.
#[derive(Default)]
struct BatchState {
    envelopes: Vec<StreamEnvelope>,
    ids: Vec<String>,
    opened_at: Option<Instant>,
}

impl BatchState {
    fn push(&mut self, id: String, envelope: StreamEnvelope) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.envelopes.push(envelope);
        self.ids.push(id);
    }

    fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    fn len(&self) -> usize {
        self.envelopes.len()
    }

    fn should_flush(&self, batch_size: usize, batch_timeout: Duration) -> bool {
        if self.envelopes.is_empty() {
            return false;
        }
        if self.envelopes.len() >= batch_size {
            return true;
        }
        match self.opened_at {
            Some(opened_at) => opened_at.elapsed() >= batch_timeout,
            None => false,
        }
    }

    fn take(&mut self) -> (Vec<StreamEnvelope>, Vec<String>) {
        self.opened_at = None;
        (
            std::mem::take(&mut self.envelopes),
            std::mem::take(&mut self.ids),
        )
    }
}

pub struct StreamConsumer {
    conn: MultiplexedConnection,
    cfg: ConsumerConfig,
    processor: Arc<dyn BatchProcessor>,
}

impl StreamConsumer {
    pub async fn connect(
        url: &str,
        cfg: ConsumerConfig,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        info!(consumer_id = %cfg.consumer_id, "stream consumer connected");
        Ok(Self {
            conn,
            cfg,
            processor,
        })
    }

    /// Consume until cancelled, flushing any pending batch before exit.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            stream = MESSAGES_STREAM,
            group = PERSIST_CONSUMER_GROUP,
            consumer_id = %self.cfg.consumer_id,
            "consuming"
        );

        let mut batch = BatchState::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_entries(&mut self.conn, &self.cfg) => match read {
                    Ok(entries) => {
                        for (id, parsed) in entries {
                            match parsed {
                                Ok(envelope) => batch.push(id, envelope),
                                Err(err) => {
                                    // Ack-and-drop: a malformed entry must
                                    // not poison the group.
                                    warn!(id = %id, error = %err, "unparseable stream entry dropped");
                                    self.ack(std::slice::from_ref(&id)).await;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "stream read failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                        }
                    }
                },
            }

            if batch.should_flush(self.cfg.batch_size, self.cfg.batch_timeout) {
                self.flush(&mut batch).await;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        info!("stream consumer stopped");
    }

    /// Hand the batch to the sink; ack only on success. On failure the
    /// entries stay pending in the group for redelivery.
    async fn flush(&mut self, batch: &mut BatchState) {
        let (envelopes, ids) = batch.take();
        debug!(count = envelopes.len(), "flushing batch");

        match tokio::time::timeout(PERSIST_TIMEOUT, self.processor.process_batch(&envelopes)).await {
            Ok(Ok(())) => self.ack(&ids).await,
            Ok(Err(err)) => {
                warn!(count = envelopes.len(), error = %err, "batch sink failed, leaving entries pending");
            }
            Err(_) => {
                warn!(count = envelopes.len(), "batch sink timed out, leaving entries pending");
            }
        }
    }

    async fn ack(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let acked: Result<u64, redis::RedisError> = self
            .conn
            .xack(MESSAGES_STREAM, PERSIST_CONSUMER_GROUP, ids)
            .await;
        match acked {
            Ok(count) => debug!(count, "acked stream entries"),
            Err(err) => warn!(error = %err, "xack failed"),
        }
    }
}

/// Read up to `batch_size` new entries for this consumer, blocking at most
/// [`READ_BLOCK`]. Each entry is returned with its stream id and parse
/// result.
#[allow(clippy::type_complexity)]
async fn read_entries(
    conn: &mut MultiplexedConnection,
    cfg: &ConsumerConfig,
) -> Result<Vec<(String, Result<StreamEnvelope, StreamError>)>, StreamError> {
    let options = StreamReadOptions::default()
        .group(PERSIST_CONSUMER_GROUP, &cfg.consumer_id)
        .count(cfg.batch_size)
        .block(READ_BLOCK.as_millis() as usize);

    // Nil reply: the block timeout expired with nothing new.
    let reply: Option<StreamReadReply> = conn
        .xread_options(&[MESSAGES_STREAM], &[">"], &options)
        .await?;
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            let parsed = StreamEnvelope::from_entry(&entry);
            entries.push((entry.id, parsed));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn envelope(room: &str) -> StreamEnvelope {
        StreamEnvelope {
            room_name: room.to_string(),
            user_id: String::new(),
            username: String::new(),
            payload: json!({"message": "x", "type": "text"}),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_batch_flushes_at_size() {
        let mut batch = BatchState::default();
        let timeout = Duration::from_secs(5);
        assert!(!batch.should_flush(3, timeout));

        batch.push("1-0".into(), envelope("r1"));
        batch.push("2-0".into(), envelope("r1"));
        assert!(!batch.should_flush(3, timeout));

        batch.push("3-0".into(), envelope("r1"));
        assert!(batch.should_flush(3, timeout));

        let (envelopes, ids) = batch.take();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(ids, vec!["1-0", "2-0", "3-0"]);
        assert!(batch.is_empty());
        assert!(!batch.should_flush(3, timeout));
    }

    #[test]
    fn test_batch_flushes_on_timeout() {
        let mut batch = BatchState::default();
        let timeout = Duration::from_millis(20);

        batch.push("1-0".into(), envelope("r1"));
        assert!(!batch.should_flush(100, timeout));

        std::thread::sleep(Duration::from_millis(30));
        assert!(batch.should_flush(100, timeout));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_empty_batch_never_flushes() {
        let batch = BatchState::default();
        assert!(!batch.should_flush(1, Duration::from_millis(0)));
    }

    #[test]
    fn test_take_reopens_batch_window() {
        let mut batch = BatchState::default();
        batch.push("1-0".into(), envelope("r1"));
        std::thread::sleep(Duration::from_millis(10));
        batch.take();

        batch.push("2-0".into(), envelope("r1"));
        // The window restarts with the new batch.
        assert!(!batch.should_flush(100, Duration::from_millis(10)));
    }

    /// Sink double used by the integration-style tests below.
    struct RecordingSink {
        batches: Mutex<Vec<Vec<StreamEnvelope>>>,
        fail: Mutex<bool>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl BatchProcessor for RecordingSink {
        async fn process_batch(&self, batch: &[StreamEnvelope]) -> anyhow::Result<()> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("sink unavailable");
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_processor_receives_batches() {
        let sink = RecordingSink::new();
        let batch = vec![envelope("r1"), envelope("r2")];
        sink.process_batch(&batch).await.unwrap();

        let seen = sink.batches.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], batch);
    }

    #[tokio::test]
    async fn test_processor_error_surfaces() {
        let sink = RecordingSink::new();
        *sink.fail.lock().unwrap() = true;
        assert!(sink.process_batch(&[envelope("r1")]).await.is_err());
        assert!(sink.batches.lock().unwrap().is_empty());
    }
}
