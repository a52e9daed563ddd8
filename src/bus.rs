//! Cross-instance fan-out over Redis Pub/Sub.
//!
//! Every broadcast is wrapped in an envelope carrying the publishing
//! instance's id. The subscriber drops envelopes tagged with its own id;
//! without that suppression two instances would rebroadcast each other's
//! frames forever.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Channel shared by every instance.
pub const BROADCAST_CHANNEL: &str = "gosocket:broadcast";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("envelope encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire envelope on the broadcast channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub instance_id: String,
    pub payload: Box<RawValue>,
}

/// The payload carried inside a `BusEnvelope`: an outbound envelope plus
/// the room it belongs to (None = deliver to every local client).
#[derive(Debug, Deserialize)]
pub struct RemoteFrame {
    pub room: Option<String>,
    pub data: Box<RawValue>,
}

impl RemoteFrame {
    pub fn encode(room: Option<&str>, data: &[u8]) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Out<'a> {
            room: Option<&'a str>,
            data: &'a RawValue,
        }
        let data: &RawValue = serde_json::from_slice(data)?;
        serde_json::to_string(&Out { room, data })
    }
}

/// Decode a bus envelope and apply loopback suppression. Returns the inner
/// payload bytes only for envelopes published by other instances.
pub(crate) fn accept_envelope(raw: &[u8], local_instance_id: &str) -> Option<Vec<u8>> {
    let envelope: BusEnvelope = match serde_json::from_slice(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "undecodable bus envelope skipped");
            return None;
        }
    };
    if envelope.instance_id == local_instance_id {
        return None;
    }
    Some(envelope.payload.get().as_bytes().to_vec())
}

pub struct PubSubAdapter {
    client: redis::Client,
    conn: MultiplexedConnection,
    instance_id: String,
}

impl PubSubAdapter {
    /// Connect and verify the server is reachable. Startup failures here
    /// are fatal for the process.
    pub async fn connect(url: &str, instance_id: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        info!(instance_id, "connected to redis pub/sub");
        Ok(Self {
            client,
            conn,
            instance_id: instance_id.to_string(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publish raw payload bytes to the broadcast channel, tagged with this
    /// instance's id.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), BusError> {
        #[derive(Serialize)]
        struct Out<'a> {
            instance_id: &'a str,
            payload: &'a RawValue,
        }
        let payload: &RawValue = serde_json::from_slice(payload).map_err(BusError::Encode)?;
        let envelope = serde_json::to_string(&Out {
            instance_id: &self.instance_id,
            payload,
        })?;

        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(BROADCAST_CHANNEL, envelope).await?;
        Ok(())
    }

    /// Start the subscriber task: consume the broadcast channel, suppress
    /// loopback, hand other instances' payloads to `handler`. Reconnects
    /// with jittered exponential backoff until cancelled.
    pub fn spawn_subscriber<F>(&self, cancel: CancellationToken, handler: F) -> JoinHandle<()>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let client = self.client.clone();
        let instance_id = self.instance_id.clone();

        tokio::spawn(async move {
            use futures_util::StreamExt;

            let mut backoff = ExponentialBackoff::new();
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(error = %err, "bus subscriber connect failed");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                };
                if let Err(err) = pubsub.subscribe(BROADCAST_CHANNEL).await {
                    warn!(error = %err, "bus subscribe failed");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }

                info!(channel = BROADCAST_CHANNEL, "bus subscriber listening");
                backoff.reset();

                let mut stream = pubsub.into_on_message();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        msg = stream.next() => {
                            let Some(msg) = msg else {
                                warn!("bus subscription ended, reconnecting");
                                break;
                            };
                            let raw: Vec<u8> = match msg.get_payload() {
                                Ok(raw) => raw,
                                Err(err) => {
                                    warn!(error = %err, "unreadable bus message skipped");
                                    continue;
                                }
                            };
                            if let Some(payload) = accept_envelope(&raw, &instance_id) {
                                handler(payload);
                            }
                        }
                    }
                }
            }
            info!("bus subscriber stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Exponential backoff with jitter (±20%)
// ---------------------------------------------------------------------------

pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 1.5,
            current: Duration::from_secs(1),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter_factor = 0.8 + 0.4 * (nanos % 1000) as f64 / 1000.0;
        let delay = Duration::from_secs_f64((base * jitter_factor).min(self.max.as_secs_f64()));
        let next = base * self.multiplier;
        self.current = Duration::from_secs_f64(next.min(self.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
