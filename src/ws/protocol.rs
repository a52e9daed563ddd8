//! Wire protocol: inbound client events and outbound server envelopes.
//!
//! Everything on the socket is UTF-8 JSON, tagged by a `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Arbitrary string-keyed user identity (`id`, `username`, extra metadata).
pub type UserInfo = Map<String, Value>;

/// Per-subscribe options.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SubscribeOptions {
    #[serde(default)]
    pub history: bool,
    #[serde(default)]
    pub limit: i64,
}

/// Events received from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Subscribe {
        #[serde(default)]
        room: String,
        #[serde(default)]
        user: Option<UserInfo>,
        #[serde(default)]
        options: Option<SubscribeOptions>,
    },
    Unsubscribe {
        #[serde(default)]
        room: String,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    Publish {
        #[serde(default)]
        room: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    Presence {
        #[serde(default)]
        room: String,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    Typing {
        #[serde(default)]
        room: String,
        #[serde(default, rename = "isTyping")]
        is_typing: bool,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    ReadReceipt {
        #[serde(default)]
        room: String,
        #[serde(default, rename = "messageId")]
        message_id: String,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    DirectMsg {
        #[serde(default, rename = "toUserId")]
        to_user_id: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        user: Option<UserInfo>,
    },
    EditMessage {
        #[serde(default)]
        room: String,
        #[serde(default, rename = "messageId")]
        message_id: String,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        user: Option<UserInfo>,
    },
}

impl ClientEvent {
    /// User info carried on the event, if any.
    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            ClientEvent::Subscribe { user, .. }
            | ClientEvent::Unsubscribe { user, .. }
            | ClientEvent::Publish { user, .. }
            | ClientEvent::Presence { user, .. }
            | ClientEvent::Typing { user, .. }
            | ClientEvent::ReadReceipt { user, .. }
            | ClientEvent::DirectMsg { user, .. }
            | ClientEvent::EditMessage { user, .. } => user.as_ref(),
        }
    }
}

/// Envelopes sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message {
        payload: Value,
        user: UserInfo,
        metadata: Map<String, Value>,
    },
    History {
        room: String,
        payload: Value,
        user: UserInfo,
        metadata: Map<String, Value>,
    },
    PresenceList {
        room: String,
        #[serde(rename = "presenceList")]
        presence_list: Vec<UserInfo>,
    },
    UserJoined {
        room: String,
        user: UserInfo,
    },
    UserLeft {
        room: String,
        user: UserInfo,
    },
    Typing {
        room: String,
        user: UserInfo,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    ReadReceipt {
        room: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "readBy")]
        read_by: UserInfo,
    },
    DirectMessage {
        from: UserInfo,
        payload: Value,
    },
    MessageEdited {
        room: String,
        #[serde(rename = "messageId")]
        message_id: String,
        payload: Value,
        #[serde(rename = "editedAt")]
        edited_at: DateTime<Utc>,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A message stored in room history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: String,
    pub payload: Value,
    pub user: UserInfo,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
}

impl RoomMessage {
    /// A message awaiting insertion; the room assigns id and metadata.
    pub fn draft(payload: Value, user: UserInfo) -> Self {
        Self {
            id: String::new(),
            payload,
            user,
            metadata: Map::new(),
            created_at: Utc::now(),
            edited_at: None,
            is_edited: false,
        }
    }
}

/// 128-bit random hex message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Shape a publish payload for history and fan-out.
///
/// Objects that already carry a `message` key pass through; everything else
/// is wrapped as `{"message": <payload>, "type": "text"}`. With
/// `passthrough` set, payloads are forwarded untouched.
pub fn normalize_payload(payload: Option<Value>, passthrough: bool) -> Value {
    let payload = payload.unwrap_or(Value::Null);
    if passthrough {
        return payload;
    }
    match payload {
        Value::Object(ref map) if map.contains_key("message") => payload,
        other => json!({ "message": other, "type": "text" }),
    }
}

/// Compare a user's `id` against a string target, tolerating numeric ids.
pub fn user_id_matches(user: &UserInfo, target: &str) -> bool {
    match user.get("id") {
        Some(Value::String(s)) => s == target,
        Some(Value::Number(n)) => n.to_string() == target,
        _ => false,
    }
}

/// True when both users carry an `id` and the ids are equal.
pub fn same_user(a: &UserInfo, b: &UserInfo) -> bool {
    match (a.get("id"), b.get("id")) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_subscribe_with_options() {
        let raw = r#"{"type":"subscribe","room":"r1","options":{"history":true,"limit":2},"user":{"id":"u1"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::Subscribe { room, options, user } => {
                assert_eq!(room, "r1");
                let options = options.unwrap();
                assert!(options.history);
                assert_eq!(options.limit, 2);
                assert_eq!(user.unwrap()["id"], "u1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_camel_case_fields() {
        let raw = r#"{"type":"direct_msg","toUserId":"42","payload":"hi"}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::DirectMsg { to_user_id, payload, .. } => {
                assert_eq!(to_user_id, "42");
                assert_eq!(payload.unwrap(), "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let raw = r#"{"type":"typing","room":"r1","isTyping":true}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::Typing { is_typing, .. } => assert!(is_typing),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_fails() {
        let raw = r#"{"type":"bogus","room":"r1"}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn test_normalize_wraps_bare_payloads() {
        let out = normalize_payload(Some(json!("hello")), false);
        assert_eq!(out, json!({"message": "hello", "type": "text"}));

        let out = normalize_payload(Some(json!({"kind": "ping"})), false);
        assert_eq!(out, json!({"message": {"kind": "ping"}, "type": "text"}));

        let out = normalize_payload(None, false);
        assert_eq!(out, json!({"message": null, "type": "text"}));
    }

    #[test]
    fn test_normalize_keeps_message_objects() {
        let payload = json!({"message": "hi", "type": "image"});
        assert_eq!(normalize_payload(Some(payload.clone()), false), payload);
    }

    #[test]
    fn test_normalize_passthrough() {
        let payload = json!({"kind": "ping"});
        assert_eq!(normalize_payload(Some(payload.clone()), true), payload);
    }

    #[test]
    fn test_server_event_field_names() {
        let mut user = UserInfo::new();
        user.insert("id".into(), json!("u1"));

        let event = ServerEvent::Typing {
            room: "r1".into(),
            user: user.clone(),
            is_typing: true,
        };
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "typing");
        assert_eq!(value["isTyping"], true);

        let event = ServerEvent::PresenceList {
            room: "r1".into(),
            presence_list: vec![user.clone()],
        };
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "presence_list");
        assert_eq!(value["presenceList"][0]["id"], "u1");

        let event = ServerEvent::ReadReceipt {
            room: "r1".into(),
            message_id: "m1".into(),
            read_by: user,
        };
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["messageId"], "m1");
        assert_eq!(value["readBy"]["id"], "u1");
    }

    #[test]
    fn test_room_message_serialization() {
        let mut msg = RoomMessage::draft(json!({"message": "a", "type": "text"}), UserInfo::new());
        msg.id = "abc".into();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], "abc");
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["isEdited"], false);
        // editedAt omitted until the message is edited
        assert!(value.get("editedAt").is_none());
    }

    #[test]
    fn test_user_id_matching() {
        let mut user = UserInfo::new();
        user.insert("id".into(), json!(7));
        assert!(user_id_matches(&user, "7"));
        assert!(!user_id_matches(&user, "8"));

        user.insert("id".into(), json!("u1"));
        assert!(user_id_matches(&user, "u1"));

        let mut other = UserInfo::new();
        other.insert("id".into(), json!("u1"));
        assert!(same_user(&user, &other));
        other.insert("id".into(), json!("u2"));
        assert!(!same_user(&user, &other));
        assert!(!same_user(&UserInfo::new(), &UserInfo::new()));
    }

    #[test]
    fn test_new_message_id_is_128_bit_hex() {
        let id = new_message_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_message_id());
    }
}
