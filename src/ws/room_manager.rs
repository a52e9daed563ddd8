//! Room directory and event dispatch.
//!
//! All operations here run on the calling connection's read task. Room
//! locks are held only for membership/history mutation; fan-out always
//! walks a snapshot taken before any enqueue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::StreamEnvelope;

use super::client::{Client, EnqueueError};
use super::hub::{HubCommand, Replicator};
use super::protocol::{
    RoomMessage, ServerEvent, SubscribeOptions, normalize_payload, same_user, user_id_matches,
};
use super::room::Room;

#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
    /// History bound applied to newly created rooms. 0 = unbounded.
    pub default_max_history: usize,
    /// Forward publish payloads untouched instead of normalizing them.
    pub payload_passthrough: bool,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            default_max_history: crate::config::DEFAULT_ROOM_HISTORY_LIMIT,
            payload_passthrough: false,
        }
    }
}

pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Shared view of the hub's client registry; mutated only by the hub
    /// loop, read here for direct-message and read-receipt routing.
    clients: Arc<DashMap<String, Arc<Client>>>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    replicator: Arc<Replicator>,
    cfg: RoomManagerConfig,
}

impl RoomManager {
    pub fn new(
        clients: Arc<DashMap<String, Arc<Client>>>,
        hub_tx: mpsc::UnboundedSender<HubCommand>,
        replicator: Arc<Replicator>,
        cfg: RoomManagerConfig,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            clients,
            hub_tx,
            replicator,
            cfg,
        }
    }

    pub fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().unwrap().get(name).cloned()
    }

    fn get_or_create_room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.get_room(name) {
            return room;
        }
        let mut rooms = self.rooms.write().unwrap();
        Arc::clone(rooms.entry(name.to_string()).or_insert_with(|| {
            debug!(room = name, "room created");
            Arc::new(Room::new(name, self.cfg.default_max_history))
        }))
    }

    /// Drop the room when both its sets are empty.
    fn remove_room_if_empty(&self, name: &str) {
        let mut rooms = self.rooms.write().unwrap();
        if let Some(room) = rooms.get(name)
            && room.is_empty()
        {
            rooms.remove(name);
            debug!(room = name, "empty room removed");
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Enqueue a frame, escalating a full queue to hub-side eviction.
    fn deliver(&self, client: &Arc<Client>, frame: Vec<u8>) {
        match client.try_enqueue(frame) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!(conn_id = client.conn_id(), "outbound queue full, dropping slow consumer");
                let _ = self
                    .hub_tx
                    .send(HubCommand::Deregister(client.conn_id().to_string()));
            }
            Err(EnqueueError::Closed) => {}
        }
    }

    fn deliver_event(&self, client: &Arc<Client>, event: &ServerEvent) {
        match event.encode() {
            Ok(frame) => self.deliver(client, frame),
            Err(err) => warn!(error = %err, "failed to serialize outbound envelope"),
        }
    }

    // -----------------------------------------------------------------------
    // Event operations
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, client: &Arc<Client>, room_name: &str, options: SubscribeOptions) {
        let room = self.get_or_create_room(room_name);
        room.subscribe(client);
        client.record_subscription(room_name);
        debug!(conn_id = client.conn_id(), room = room_name, "subscribed");

        if options.history {
            for msg in room.history(options.limit) {
                self.deliver_event(
                    client,
                    &ServerEvent::History {
                        room: room_name.to_string(),
                        payload: msg.payload,
                        user: msg.user,
                        metadata: msg.metadata,
                    },
                );
            }
        }
    }

    pub fn unsubscribe(&self, client: &Arc<Client>, room_name: &str) {
        let Some(room) = self.get_room(room_name) else {
            return;
        };
        room.unsubscribe(client.conn_id());
        client.forget_subscription(room_name);
        debug!(conn_id = client.conn_id(), room = room_name, "unsubscribed");
        self.remove_room_if_empty(room_name);
    }

    /// Publish into a room: append to history, fan out to the subscriber
    /// snapshot, then replicate to peer instances and the durable stream.
    pub async fn publish(&self, client: &Arc<Client>, room_name: &str, payload: Option<Value>) {
        let Some(room) = self.get_room(room_name) else {
            debug!(room = room_name, "publish to nonexistent room dropped");
            return;
        };

        let payload = normalize_payload(payload, self.cfg.payload_passthrough);
        let mut draft = RoomMessage::draft(payload, client.user_info());
        draft.metadata = room.metadata_snapshot();
        let msg = room.add_message(draft);

        let event = ServerEvent::Message {
            payload: msg.payload.clone(),
            user: msg.user.clone(),
            metadata: msg.metadata.clone(),
        };
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize message envelope");
                return;
            }
        };

        let subscribers = room.subscriber_snapshot();
        debug!(room = room_name, subscribers = subscribers.len(), "publishing message");
        for subscriber in &subscribers {
            self.deliver(subscriber, frame.clone());
        }

        let envelope = StreamEnvelope::from_room_message(room_name, &msg);
        self.replicator
            .replicate(Some(room_name), &frame, Some(envelope))
            .await;
    }

    /// Add presence tracking: send the current presence list to the caller
    /// and notify other presence clients, suppressing the join echo.
    pub fn add_presence(&self, client: &Arc<Client>, room_name: &str) {
        let room = self.get_or_create_room(room_name);
        room.add_presence(client);
        client.record_presence(room_name);
        debug!(conn_id = client.conn_id(), room = room_name, "presence added");

        self.deliver_event(
            client,
            &ServerEvent::PresenceList {
                room: room_name.to_string(),
                presence_list: room.presence_list(),
            },
        );

        let user = client.user_info();
        let event = ServerEvent::UserJoined {
            room: room_name.to_string(),
            user: user.clone(),
        };
        for other in room.presence_snapshot() {
            if same_user(&other.user_info(), &user) {
                continue;
            }
            self.deliver_event(&other, &event);
        }
    }

    pub fn remove_presence(&self, client: &Arc<Client>, room_name: &str) {
        let Some(room) = self.get_room(room_name) else {
            return;
        };
        room.remove_presence(client.conn_id());
        client.forget_presence(room_name);
        debug!(conn_id = client.conn_id(), room = room_name, "presence removed");

        let event = ServerEvent::UserLeft {
            room: room_name.to_string(),
            user: client.user_info(),
        };
        for other in room.presence_snapshot() {
            self.deliver_event(&other, &event);
        }

        self.remove_room_if_empty(room_name);
    }

    /// Fan a typing indicator out to every subscriber except the sender.
    pub fn typing(&self, client: &Arc<Client>, room_name: &str, is_typing: bool) {
        let Some(room) = self.get_room(room_name) else {
            return;
        };
        let event = ServerEvent::Typing {
            room: room_name.to_string(),
            user: client.user_info(),
            is_typing,
        };
        for subscriber in room.subscriber_snapshot() {
            if subscriber.conn_id() == client.conn_id() {
                continue;
            }
            self.deliver_event(&subscriber, &event);
        }
    }

    /// Route a read receipt to the author of the message, when the author
    /// is still connected to this instance.
    pub fn read_receipt(&self, client: &Arc<Client>, room_name: &str, message_id: &str) {
        let Some(room) = self.get_room(room_name) else {
            return;
        };
        let Some(author) = room.message_author(message_id) else {
            debug!(room = room_name, message_id, "read receipt for unknown message");
            return;
        };
        let Some(author_id) = author.get("id").cloned() else {
            return;
        };

        let event = ServerEvent::ReadReceipt {
            room: room_name.to_string(),
            message_id: message_id.to_string(),
            read_by: client.user_info(),
        };
        for entry in self.clients.iter() {
            if entry.value().user_info().get("id") == Some(&author_id) {
                self.deliver_event(entry.value(), &event);
            }
        }
    }

    /// Deliver a direct message to every local connection of the target
    /// user. Silent when the recipient is not connected to this instance.
    pub fn direct_message(&self, client: &Arc<Client>, to_user_id: &str, payload: Option<Value>) {
        if to_user_id.is_empty() {
            return;
        }
        let event = ServerEvent::DirectMessage {
            from: client.user_info(),
            payload: payload.unwrap_or(Value::Null),
        };
        for entry in self.clients.iter() {
            if user_id_matches(&entry.value().user_info(), to_user_id) {
                self.deliver_event(entry.value(), &event);
            }
        }
    }

    /// Edit a message. Only the original author may edit; unauthorized
    /// attempts are dropped without an error envelope.
    pub fn edit_message(
        &self,
        client: &Arc<Client>,
        room_name: &str,
        message_id: &str,
        payload: Option<Value>,
    ) {
        let Some(room) = self.get_room(room_name) else {
            return;
        };
        let Some(author) = room.message_author(message_id) else {
            debug!(room = room_name, message_id, "edit of unknown message dropped");
            return;
        };
        if !same_user(&author, &client.user_info()) {
            debug!(
                conn_id = client.conn_id(),
                room = room_name,
                message_id,
                "edit by non-author dropped"
            );
            return;
        }

        let payload = payload.unwrap_or(Value::Null);
        let Some(edited) = room.edit_message(message_id, payload) else {
            return;
        };

        let event = ServerEvent::MessageEdited {
            room: room_name.to_string(),
            message_id: message_id.to_string(),
            payload: edited.payload,
            edited_at: edited.edited_at.unwrap_or(edited.created_at),
        };
        for subscriber in room.subscriber_snapshot() {
            self.deliver_event(&subscriber, &event);
        }
    }

    /// Remove a client from every room it touches. The membership snapshot
    /// is taken under the client lock, which is released before any room
    /// lock is acquired (client lock always before room lock).
    pub fn remove_client_from_all_rooms(&self, client: &Arc<Client>) {
        let (subscriptions, presence_rooms) = client.membership_snapshot();
        for room_name in subscriptions {
            self.unsubscribe(client, &room_name);
        }
        for room_name in presence_rooms {
            self.remove_presence(client, &room_name);
        }
    }
}
