//! Durable tail: Redis Stream producer and envelope.
//!
//! Each published message becomes one flat stream entry; `payload` and
//! `metadata` are embedded as JSON strings so the entry stays a plain
//! key/value record.

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ws::protocol::{RoomMessage, UserInfo};

/// Stream holding every published message until the workers persist it.
pub const MESSAGES_STREAM: &str = "gosocket:messages:stream";

/// Consumer group shared by the persistence workers.
pub const PERSIST_CONSUMER_GROUP: &str = "persist-workers";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream entry missing field `{0}`")]
    MissingField(&'static str),
}

/// One message bound for durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub room_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl StreamEnvelope {
    pub fn from_parts(room_name: &str, user: Option<&UserInfo>, payload: Value, metadata: Value) -> Self {
        let user_id = user
            .and_then(|u| u.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let username = user
            .and_then(|u| u.get("username"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            room_name: room_name.to_string(),
            user_id,
            username,
            payload,
            metadata,
        }
    }

    pub fn from_room_message(room_name: &str, msg: &RoomMessage) -> Self {
        Self::from_parts(
            room_name,
            Some(&msg.user),
            msg.payload.clone(),
            Value::Object(msg.metadata.clone()),
        )
    }

    /// Flat field map for XADD; `payload` and `metadata` become JSON
    /// strings.
    pub fn to_entry_fields(&self) -> Result<Vec<(&'static str, String)>, StreamError> {
        Ok(vec![
            ("room_name", self.room_name.clone()),
            ("user_id", self.user_id.clone()),
            ("username", self.username.clone()),
            ("payload", serde_json::to_string(&self.payload)?),
            ("metadata", serde_json::to_string(&self.metadata)?),
        ])
    }

    /// Parse a stream entry read back from the consumer group.
    pub fn from_entry(entry: &StreamId) -> Result<Self, StreamError> {
        let room_name: String = entry
            .get("room_name")
            .ok_or(StreamError::MissingField("room_name"))?;
        let user_id: String = entry.get("user_id").unwrap_or_default();
        let username: String = entry.get("username").unwrap_or_default();

        let payload_json: String = entry.get("payload").unwrap_or_default();
        let payload = if payload_json.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&payload_json)?
        };
        let metadata_json: String = entry.get("metadata").unwrap_or_default();
        let metadata = if metadata_json.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&metadata_json)?
        };

        Ok(Self {
            room_name,
            user_id,
            username,
            payload,
            metadata,
        })
    }
}

pub struct StreamProducer {
    conn: MultiplexedConnection,
}

impl StreamProducer {
    /// Connect, verify the server, and idempotently create the stream and
    /// consumer group starting at offset 0.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        ensure_consumer_group(&mut conn).await;
        info!(stream = MESSAGES_STREAM, "stream producer connected");
        Ok(Self { conn })
    }

    /// Append one envelope to the stream.
    pub async fn publish(&self, envelope: &StreamEnvelope) -> Result<(), StreamError> {
        let fields = envelope.to_entry_fields()?;
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(MESSAGES_STREAM, "*", &fields).await?;
        debug!(id = %id, room = %envelope.room_name, "appended to stream");
        Ok(())
    }
}

/// `XGROUP CREATE ... MKSTREAM 0`, tolerating an already-existing group.
pub(crate) async fn ensure_consumer_group(conn: &mut MultiplexedConnection) {
    let created: Result<String, redis::RedisError> = conn
        .xgroup_create_mkstream(MESSAGES_STREAM, PERSIST_CONSUMER_GROUP, 0)
        .await;
    match created {
        Ok(_) => info!(group = PERSIST_CONSUMER_GROUP, "consumer group created"),
        Err(err) if err.code() == Some("BUSYGROUP") => {}
        Err(err) => warn!(error = %err, "could not create consumer group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        redis::Value::BulkString(v.as_bytes().to_vec()),
                    )
                })
                .collect::<HashMap<_, _>>(),
        }
    }

    fn sample_user() -> UserInfo {
        let mut user = UserInfo::new();
        user.insert("id".into(), json!("u1"));
        user.insert("username".into(), json!("ana"));
        user
    }

    #[test]
    fn test_entry_fields_embed_json_strings() {
        let envelope = StreamEnvelope::from_parts(
            "r1",
            Some(&sample_user()),
            json!({"message": "hi", "type": "text"}),
            json!({"room": "r1"}),
        );
        let fields = envelope.to_entry_fields().unwrap();
        let map: HashMap<_, _> = fields.into_iter().collect();

        assert_eq!(map["room_name"], "r1");
        assert_eq!(map["user_id"], "u1");
        assert_eq!(map["username"], "ana");
        // Embedded JSON strings, not nested structures.
        let payload: Value = serde_json::from_str(&map["payload"]).unwrap();
        assert_eq!(payload["message"], "hi");
        let metadata: Value = serde_json::from_str(&map["metadata"]).unwrap();
        assert_eq!(metadata["room"], "r1");
    }

    #[test]
    fn test_numeric_user_id_is_stringified() {
        let mut user = UserInfo::new();
        user.insert("id".into(), json!(42));
        let envelope = StreamEnvelope::from_parts("r1", Some(&user), Value::Null, Value::Null);
        assert_eq!(envelope.user_id, "42");
    }

    #[test]
    fn test_from_entry_round_trip() {
        let parsed = StreamEnvelope::from_entry(&entry(&[
            ("room_name", "r1"),
            ("user_id", "u1"),
            ("username", "ana"),
            ("payload", r#"{"message":"hi","type":"text"}"#),
            ("metadata", r#"{"room":"r1"}"#),
        ]))
        .unwrap();

        assert_eq!(parsed.room_name, "r1");
        assert_eq!(parsed.user_id, "u1");
        assert_eq!(parsed.payload["message"], "hi");
        assert_eq!(parsed.metadata["room"], "r1");
    }

    #[test]
    fn test_from_entry_missing_room_name() {
        let err = StreamEnvelope::from_entry(&entry(&[("payload", "{}")])).unwrap_err();
        assert!(matches!(err, StreamError::MissingField("room_name")));
    }

    #[test]
    fn test_from_entry_rejects_bad_payload_json() {
        let result = StreamEnvelope::from_entry(&entry(&[
            ("room_name", "r1"),
            ("payload", "{broken"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_entry_tolerates_absent_optional_fields() {
        let parsed = StreamEnvelope::from_entry(&entry(&[("room_name", "r1")])).unwrap();
        assert_eq!(parsed.user_id, "");
        assert_eq!(parsed.username, "");
        assert_eq!(parsed.payload, Value::Null);
    }
}
