//! Central coordination loop.
//!
//! The hub loop is the sole mutator of the local client registry: clients
//! are registered after the WebSocket handshake and deregistered when their
//! read task exits or when an enqueue fails (slow consumer). Removal and
//! queue close happen in the same step, so a queue is closed exactly once.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{PubSubAdapter, RemoteFrame};
use crate::stream::{StreamEnvelope, StreamProducer};

use super::client::{Client, EnqueueError};
use super::protocol::UserInfo;
use super::room_manager::{RoomManager, RoomManagerConfig};

/// A non-room envelope broadcast to every local client.
#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug)]
pub enum HubCommand {
    Register(Arc<Client>),
    Deregister(String),
    Broadcast(Broadcast),
}

/// Optional replication sinks for broadcasts: the cross-instance bus and
/// the durable stream. Both absent in local-only mode.
pub struct Replicator {
    bus: Option<Arc<PubSubAdapter>>,
    producer: Option<Arc<StreamProducer>>,
}

impl Replicator {
    pub fn new(bus: Option<Arc<PubSubAdapter>>, producer: Option<Arc<StreamProducer>>) -> Self {
        Self { bus, producer }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Replicate an already-serialized envelope: publish it for peer
    /// instances and append it to the durable stream. Failures are logged;
    /// local delivery has already happened.
    pub async fn replicate(&self, room: Option<&str>, frame: &[u8], envelope: Option<StreamEnvelope>) {
        if let Some(bus) = &self.bus {
            match RemoteFrame::encode(room, frame) {
                Ok(payload) => {
                    if let Err(err) = bus.publish(payload.as_bytes()).await {
                        warn!(error = %err, "bus publish failed");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode bus frame"),
            }
        }
        if let (Some(producer), Some(envelope)) = (&self.producer, envelope) {
            if let Err(err) = producer.publish(&envelope).await {
                warn!(error = %err, "stream append failed");
            }
        }
    }
}

pub struct Hub {
    clients: Arc<DashMap<String, Arc<Client>>>,
    tx: mpsc::UnboundedSender<HubCommand>,
    room_manager: Arc<RoomManager>,
    replicator: Arc<Replicator>,
    cancel: CancellationToken,
}

impl Hub {
    pub fn new(
        cfg: RoomManagerConfig,
        replicator: Arc<Replicator>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HubCommand>) {
        let clients = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let room_manager = Arc::new(RoomManager::new(
            Arc::clone(&clients),
            tx.clone(),
            Arc::clone(&replicator),
            cfg,
        ));
        let hub = Arc::new(Self {
            clients,
            tx,
            room_manager,
            replicator,
            cancel,
        });
        (hub, rx)
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    pub fn register(&self, client: Arc<Client>) {
        let _ = self.tx.send(HubCommand::Register(client));
    }

    pub fn deregister(&self, conn_id: &str) {
        let _ = self.tx.send(HubCommand::Deregister(conn_id.to_string()));
    }

    pub fn broadcast(&self, broadcast: Broadcast) {
        let _ = self.tx.send(HubCommand::Broadcast(broadcast));
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains_client(&self, conn_id: &str) -> bool {
        self.clients.contains_key(conn_id)
    }

    /// The hub command loop. Runs until shutdown or until every sender is
    /// gone, then closes the queue of every remaining client.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd).await;
                }
            }
        }

        for entry in self.clients.iter() {
            entry.value().close_queue();
        }
        self.clients.clear();
        info!("hub loop stopped");
    }

    async fn handle(&self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(client) => {
                self.clients.insert(client.conn_id().to_string(), client);
                info!(total = self.clients.len(), "client connected");
            }
            HubCommand::Deregister(conn_id) => {
                if let Some((_, client)) = self.clients.remove(&conn_id) {
                    client.close_queue();
                    info!(total = self.clients.len(), "client disconnected");
                }
            }
            HubCommand::Broadcast(broadcast) => self.fan_out(broadcast).await,
        }
    }

    async fn fan_out(&self, broadcast: Broadcast) {
        let frame = match serde_json::to_vec(&broadcast) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize broadcast");
                return;
            }
        };

        let snapshot: Vec<Arc<Client>> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        debug!(clients = snapshot.len(), "broadcasting");
        for client in snapshot {
            match client.try_enqueue(frame.clone()) {
                Ok(()) | Err(EnqueueError::Closed) => {}
                Err(EnqueueError::Full) => {
                    // Running inside the hub loop: remove and close here.
                    if let Some((_, slow)) = self.clients.remove(client.conn_id()) {
                        slow.close_queue();
                        warn!(conn_id = client.conn_id(), "dropped slow consumer during broadcast");
                    }
                }
            }
        }

        let envelope = StreamEnvelope::from_parts(
            "",
            broadcast.user.as_ref(),
            broadcast.payload,
            broadcast.metadata.map(Value::Object).unwrap_or(Value::Null),
        );
        self.replicator.replicate(None, &frame, Some(envelope)).await;
    }

    /// Re-emit a frame received from a peer instance. Room frames go to the
    /// local subscribers of that room; roomless frames go to every local
    /// client. Never republished, and never added to local history.
    pub fn handle_remote(&self, payload: &[u8]) {
        let frame = match serde_json::from_slice::<RemoteFrame>(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "undecodable bus frame skipped");
                return;
            }
        };
        let data = frame.data.get().as_bytes().to_vec();

        match frame.room.as_deref() {
            Some(room_name) => {
                let Some(room) = self.room_manager.get_room(room_name) else {
                    debug!(room = room_name, "remote frame for absent room dropped");
                    return;
                };
                for subscriber in room.subscriber_snapshot() {
                    self.enqueue_remote(&subscriber, data.clone());
                }
            }
            None => {
                let snapshot: Vec<Arc<Client>> =
                    self.clients.iter().map(|e| Arc::clone(e.value())).collect();
                for client in snapshot {
                    self.enqueue_remote(&client, data.clone());
                }
            }
        }
    }

    fn enqueue_remote(&self, client: &Arc<Client>, frame: Vec<u8>) {
        match client.try_enqueue(frame) {
            Ok(()) | Err(EnqueueError::Closed) => {}
            Err(EnqueueError::Full) => {
                // Not on the hub loop here; route the eviction through it.
                warn!(conn_id = client.conn_id(), "outbound queue full, dropping slow consumer");
                let _ = self
                    .tx
                    .send(HubCommand::Deregister(client.conn_id().to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::ws::protocol::SubscribeOptions;

    async fn started_hub() -> (Arc<Hub>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (hub, rx) = Hub::new(
            RoomManagerConfig::default(),
            Arc::new(Replicator::disabled()),
            cancel.clone(),
        );
        tokio::spawn(Arc::clone(&hub).run(rx));
        (hub, cancel)
    }

    async fn settle() {
        // Let the hub loop drain its command queue.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (hub, _cancel) = started_hub().await;
        let (client, _rx) = Client::new("c1".into());

        hub.register(Arc::clone(&client));
        settle().await;
        assert_eq!(hub.client_count(), 1);
        assert!(hub.contains_client("c1"));

        hub.deregister("c1");
        settle().await;
        assert_eq!(hub.client_count(), 0);
        assert!(client.is_closed());

        // Deregistering an unknown client is a no-op.
        hub.deregister("c1");
        settle().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let (hub, _cancel) = started_hub().await;
        let (a, mut rx_a) = Client::new("ca".into());
        let (b, mut rx_b) = Client::new("cb".into());
        hub.register(a);
        hub.register(b);
        settle().await;

        hub.broadcast(Broadcast {
            payload: json!({"announce": "hi"}),
            user: None,
            metadata: None,
        });
        settle().await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.try_recv().unwrap();
            let value: Value = serde_json::from_slice(&frame).unwrap();
            assert_eq!(value["payload"]["announce"], "hi");
            assert!(value.get("user").is_none());
        }
    }

    #[tokio::test]
    async fn test_broadcast_evicts_slow_consumer() {
        let (hub, _cancel) = started_hub().await;
        let (slow, _rx_slow) = Client::new("cs".into());
        hub.register(Arc::clone(&slow));
        settle().await;

        for _ in 0..crate::ws::client::OUTBOUND_QUEUE_SIZE + 1 {
            hub.broadcast(Broadcast {
                payload: json!("x"),
                user: None,
                metadata: None,
            });
        }
        settle().await;

        assert!(!hub.contains_client("cs"));
        assert!(slow.is_closed());
    }

    #[tokio::test]
    async fn test_handle_remote_routes_to_room_subscribers() {
        let (hub, _cancel) = started_hub().await;
        let (a, mut rx_a) = Client::new("ca".into());
        let (b, mut rx_b) = Client::new("cb".into());
        hub.register(Arc::clone(&a));
        hub.register(Arc::clone(&b));
        settle().await;
        hub.room_manager().subscribe(&a, "r1", SubscribeOptions::default());

        let inner = serde_json::to_vec(&json!({"type": "message", "payload": "remote"})).unwrap();
        let frame = RemoteFrame::encode(Some("r1"), &inner).unwrap();
        hub.handle_remote(frame.as_bytes());

        let value: Value = serde_json::from_slice(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(value["payload"], "remote");
        assert!(rx_b.try_recv().is_err(), "non-subscriber received a room frame");

        // Frames for rooms this instance does not know are dropped.
        let frame = RemoteFrame::encode(Some("elsewhere"), &inner).unwrap();
        hub.handle_remote(frame.as_bytes());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_remote_global_frame() {
        let (hub, _cancel) = started_hub().await;
        let (a, mut rx_a) = Client::new("ca".into());
        hub.register(a);
        settle().await;

        let inner = serde_json::to_vec(&json!({"payload": "to-everyone"})).unwrap();
        let frame = RemoteFrame::encode(None, &inner).unwrap();
        hub.handle_remote(frame.as_bytes());

        let value: Value = serde_json::from_slice(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(value["payload"], "to-everyone");

        hub.handle_remote(b"not json");
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (hub, cancel) = started_hub().await;
        let (client, _rx) = Client::new("c1".into());
        hub.register(Arc::clone(&client));
        settle().await;

        cancel.cancel();
        settle().await;
        assert!(client.is_closed());
        assert_eq!(hub.client_count(), 0);
    }
}
