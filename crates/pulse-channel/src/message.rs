//! Tag-discriminated wire messages.
//!
//! Every frame is a JSON object with a required string `type`; everything
//! else is open-schema. Two envelope shapes are seen in practice: a nested
//! `{type, payload, timestamp}` envelope, and a flat object carrying domain
//! fields (room, user, ...) next to the tag. Both parse into [`Message`].

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChannelError, ChannelResult};

/// Message tag.
///
/// Known tags get their own variant; anything else lands in
/// [`MessageType::Other`]. Equality and hashing go through the wire string,
/// so `Other("ping".into())` and `Ping` are the same tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Client keep-alive.
    Ping,
    /// Server keep-alive reply.
    Pong,
    /// Incremental update on a monitoring stream.
    StreamUpdate,
    /// A trinity processing job finished.
    TrinityProcessingComplete,
    /// A chat message posted to a room.
    ChatMessage,
    /// A room participant is typing.
    Typing,
    /// A participant joined a room.
    UserJoined,
    /// A participant left a room.
    UserLeft,
    /// A memory record was created.
    MemoryCreated,
    /// A memory record was updated.
    MemoryUpdated,
    /// A memory record was deleted.
    MemoryDeleted,
    /// Federation peer status changed.
    FederationStatus,
    /// Any tag this crate has no variant for.
    Other(String),
}

impl MessageType {
    /// Resolve a wire tag to its variant.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "stream.update" => Self::StreamUpdate,
            "trinity_processing_complete" => Self::TrinityProcessingComplete,
            "chat_message" => Self::ChatMessage,
            "typing" => Self::Typing,
            "user_joined" => Self::UserJoined,
            "user_left" => Self::UserLeft,
            "memory_created" => Self::MemoryCreated,
            "memory_updated" => Self::MemoryUpdated,
            "memory_deleted" => Self::MemoryDeleted,
            "federation_status" => Self::FederationStatus,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::StreamUpdate => "stream.update",
            Self::TrinityProcessingComplete => "trinity_processing_complete",
            Self::ChatMessage => "chat_message",
            Self::Typing => "typing",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::MemoryCreated => "memory_created",
            Self::MemoryUpdated => "memory_updated",
            Self::MemoryDeleted => "memory_deleted",
            Self::FederationStatus => "federation_status",
            Self::Other(tag) => tag,
        }
    }

    /// Returns true if this tag has a dedicated variant.
    pub fn is_known(&self) -> bool {
        !matches!(Self::from_tag(self.as_str()), Self::Other(_))
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        Self::from_tag(&s)
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self::from_tag(s)
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

/// Which envelope shape a message arrived in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Envelope {
    /// `{type, payload, timestamp}`.
    Nested,
    /// Domain fields next to the tag.
    Flat,
}

/// A tagged wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Message {
    /// Create a message with the given tag and no other fields.
    pub fn new(kind: impl Into<MessageType>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// The heartbeat frame, `{"type":"ping"}`.
    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    /// Attach a nested payload.
    #[must_use]
    pub fn with_payload(self, payload: Value) -> Self {
        self.with_field("payload", payload)
    }

    /// Attach an ISO-8601 timestamp.
    #[must_use]
    pub fn with_timestamp(self, at: DateTime<Utc>) -> Self {
        let stamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.with_field("timestamp", Value::String(stamp))
    }

    /// Attach the current time as timestamp.
    #[must_use]
    pub fn stamped(self) -> Self {
        self.with_timestamp(Utc::now())
    }

    /// Attach an arbitrary top-level field. A `type` key is ignored: the tag
    /// is fixed at construction.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value);
        }
        self
    }

    /// Parse a text frame.
    ///
    /// Fails for unparseable text, for JSON that is not an object, and for
    /// objects without a string `type`.
    pub fn parse(text: &str) -> ChannelResult<Self> {
        serde_json::from_str(text).map_err(|e| ChannelError::parse(e.to_string()))
    }

    /// Serialize to the wire format.
    pub fn to_wire(&self) -> ChannelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The message tag.
    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    /// Everything except the tag.
    pub fn body(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consume the message, returning tag and body.
    pub fn into_parts(self) -> (MessageType, Map<String, Value>) {
        (self.kind, self.fields)
    }

    /// A top-level field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The nested payload, when the message uses the nested envelope.
    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    /// The `timestamp` field, if present and valid RFC 3339.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.fields.get("timestamp")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Detected envelope shape.
    pub fn envelope(&self) -> Envelope {
        if self.fields.contains_key("payload") {
            Envelope::Nested
        } else {
            Envelope::Flat
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_ping_wire_format() {
        assert_eq!(Message::ping().to_wire().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_parse_nested_envelope() {
        let text = r#"{"type":"stream.update","payload":{"cpu":0.42},"timestamp":"2026-03-01T12:00:00.000Z"}"#;
        let msg = Message::parse(text).unwrap();

        assert_eq!(msg.kind(), &MessageType::StreamUpdate);
        assert_eq!(msg.envelope(), Envelope::Nested);
        assert_eq!(msg.payload(), Some(&json!({"cpu": 0.42})));
        assert_eq!(
            msg.timestamp().map(|t| t.to_rfc3339()),
            Some("2026-03-01T12:00:00+00:00".to_string())
        );
        assert!(!msg.body().contains_key("type"));
    }

    #[test]
    fn test_parse_flat_envelope() {
        let text = r#"{"type":"user_joined","room_id":"lobby","user_id":"u-7"}"#;
        let msg = Message::parse(text).unwrap();

        assert_eq!(msg.kind(), &MessageType::UserJoined);
        assert_eq!(msg.envelope(), Envelope::Flat);
        assert_eq!(msg.field("room_id"), Some(&json!("lobby")));
        assert_eq!(msg.body().len(), 2);
    }

    #[test]
    fn test_parse_unknown_tag_falls_back() {
        let msg = Message::parse(r#"{"type":"quota.warning","used":93}"#).unwrap();
        assert_eq!(msg.kind(), &MessageType::Other("quota.warning".to_string()));
        assert!(!msg.kind().is_known());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            Message::parse("not json"),
            Err(ChannelError::Parse { .. })
        ));
        assert!(matches!(
            Message::parse(r#"[1,2,3]"#),
            Err(ChannelError::Parse { .. })
        ));
        assert!(matches!(
            Message::parse(r#"{"payload":{}}"#),
            Err(ChannelError::Parse { .. })
        ));
        assert!(matches!(
            Message::parse(r#"{"type":42}"#),
            Err(ChannelError::Parse { .. })
        ));
        assert!(matches!(
            Message::parse(r#""ping""#),
            Err(ChannelError::Parse { .. })
        ));
    }

    #[test]
    fn test_tag_equality_goes_through_wire_string() {
        assert_eq!(MessageType::Other("ping".to_string()), MessageType::Ping);
        assert_eq!(MessageType::from("memory_deleted"), MessageType::MemoryDeleted);
        assert_eq!(String::from(MessageType::StreamUpdate), "stream.update");
    }

    #[test]
    fn test_with_field_cannot_override_tag() {
        let msg = Message::new(MessageType::ChatMessage)
            .with_field("type", json!("ping"))
            .with_field("text", json!("hi"));
        assert_eq!(msg.kind(), &MessageType::ChatMessage);
        assert_eq!(
            msg.to_wire().unwrap(),
            r#"{"type":"chat_message","text":"hi"}"#
        );
    }

    #[test]
    fn test_invalid_timestamp_is_none() {
        let msg = Message::parse(r#"{"type":"pong","timestamp":"yesterday"}"#).unwrap();
        assert!(msg.timestamp().is_none());
    }
}
