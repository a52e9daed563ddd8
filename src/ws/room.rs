//! A single room: subscriber set, presence set, bounded message history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use super::client::Client;
use super::protocol::{RoomMessage, UserInfo, new_message_id};

pub struct Room {
    name: String,
    /// History bound; 0 = unbounded.
    max_history: usize,
    created_at: DateTime<Utc>,
    inner: RwLock<RoomInner>,
}

#[derive(Default)]
struct RoomInner {
    subscribers: HashMap<String, Arc<Client>>,
    presence: HashMap<String, Arc<Client>>,
    history: VecDeque<RoomMessage>,
    metadata: Map<String, Value>,
}

impl Room {
    pub fn new(name: &str, max_history: usize) -> Self {
        let mut metadata = Map::new();
        metadata.insert("room".into(), json!(name));
        Self {
            name: name.to_string(),
            max_history,
            created_at: Utc::now(),
            inner: RwLock::new(RoomInner {
                metadata,
                ..RoomInner::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, client: &Arc<Client>) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribers.insert(client.conn_id().to_string(), Arc::clone(client));
    }

    pub fn unsubscribe(&self, conn_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribers.remove(conn_id);
    }

    pub fn add_presence(&self, client: &Arc<Client>) {
        let mut inner = self.inner.write().unwrap();
        inner.presence.insert(client.conn_id().to_string(), Arc::clone(client));
    }

    pub fn remove_presence(&self, conn_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.presence.remove(conn_id);
    }

    /// Append a message to history: assigns an id when missing, stamps
    /// `room` and `createdAt` into its metadata, and evicts from the head
    /// while the history bound is exceeded. Returns the stored record.
    pub fn add_message(&self, mut msg: RoomMessage) -> RoomMessage {
        let mut inner = self.inner.write().unwrap();

        if msg.id.is_empty() {
            msg.id = new_message_id();
        }
        msg.metadata.insert("room".into(), json!(self.name));
        msg.metadata.insert("createdAt".into(), json!(msg.created_at));

        inner.history.push_back(msg.clone());
        while self.max_history > 0 && inner.history.len() > self.max_history {
            inner.history.pop_front();
        }

        msg
    }

    /// Replace the payload of the message with the given id. The id stays
    /// stable; `editedAt` and `isEdited` are stamped on the record and its
    /// metadata. Returns the updated record, or None when no message with
    /// that id is in history.
    pub fn edit_message(&self, message_id: &str, payload: Value) -> Option<RoomMessage> {
        let mut inner = self.inner.write().unwrap();
        let msg = inner.history.iter_mut().find(|m| m.id == message_id)?;

        let now = Utc::now();
        msg.payload = payload;
        msg.edited_at = Some(now);
        msg.is_edited = true;
        msg.metadata.insert("editedAt".into(), json!(now));
        msg.metadata.insert("isEdited".into(), json!(true));

        Some(msg.clone())
    }

    /// Snapshot of the last `limit` messages (all when `limit <= 0` or
    /// larger than the history).
    pub fn history(&self, limit: i64) -> Vec<RoomMessage> {
        let inner = self.inner.read().unwrap();
        let len = inner.history.len();
        let take = if limit <= 0 || limit as usize >= len {
            len
        } else {
            limit as usize
        };
        inner.history.iter().skip(len - take).cloned().collect()
    }

    /// User info of the author of the message with the given id.
    pub fn message_author(&self, message_id: &str) -> Option<UserInfo> {
        let inner = self.inner.read().unwrap();
        inner
            .history
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.user.clone())
    }

    pub fn subscriber_snapshot(&self) -> Vec<Arc<Client>> {
        let inner = self.inner.read().unwrap();
        inner.subscribers.values().cloned().collect()
    }

    pub fn presence_snapshot(&self) -> Vec<Arc<Client>> {
        let inner = self.inner.read().unwrap();
        inner.presence.values().cloned().collect()
    }

    /// User-info snapshots for the union of subscribers and presence
    /// clients, deduplicated by connection.
    pub fn presence_list(&self) -> Vec<UserInfo> {
        let inner = self.inner.read().unwrap();
        let mut seen = AHashSet::new();
        let mut list = Vec::new();
        for client in inner.subscribers.values().chain(inner.presence.values()) {
            if !seen.insert(client.conn_id().to_string()) {
                continue;
            }
            let user = client.user_info();
            if !user.is_empty() {
                list.push(user);
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.subscribers.is_empty() && inner.presence.is_empty()
    }

    /// Metadata snapshot plus creation time and membership counts.
    pub fn metadata_snapshot(&self) -> Map<String, Value> {
        let inner = self.inner.read().unwrap();
        let mut meta = inner.metadata.clone();
        meta.insert("createdAt".into(), json!(self.created_at));
        meta.insert("subscriberCount".into(), json!(inner.subscribers.len()));
        meta.insert("presenceCount".into(), json!(inner.presence.len()));
        meta
    }
}
