//! Events delivered to subscribers, and the names they subscribe under.

use std::{fmt, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    error::ChannelError,
    message::{Message, MessageType},
};

/// A value delivered to handlers.
#[derive(Clone, Debug)]
pub enum Event {
    /// The socket opened.
    Connected,
    /// The socket closed, intentionally or not.
    Disconnected {
        /// Close reason reported by the peer or the transport, if any.
        reason: Option<String>,
    },
    /// A transport-level failure. The reconnection cycle continues.
    Error(Arc<ChannelError>),
    /// An inbound message, tag included.
    Message(Message),
    /// An inbound message routed by tag, carrying only its body.
    Typed {
        /// The message tag.
        tag: MessageType,
        /// Every field except the tag.
        body: Map<String, Value>,
    },
    /// Automatic reconnection gave up.
    ReconnectFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
}

impl Event {
    /// The name this event is dispatched under.
    pub fn name(&self) -> EventName {
        match self {
            Self::Connected => EventName::Connected,
            Self::Disconnected { .. } => EventName::Disconnected,
            Self::Error(_) => EventName::Error,
            Self::Message(_) => EventName::Message,
            Self::Typed { tag, .. } => EventName::Tag(tag.clone()),
            Self::ReconnectFailed { .. } => EventName::ReconnectFailed,
        }
    }

    /// Field lookup on the body of a message or typed event.
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Message(msg) => msg.field(key),
            Self::Typed { body, .. } => body.get(key),
            _ => None,
        }
    }

    pub(crate) fn typed(msg: &Message) -> Self {
        Self::Typed {
            tag: msg.kind().clone(),
            body: msg.body().clone(),
        }
    }
}

/// Subscription key: a lifecycle name or a message tag.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventName {
    /// `connected`
    Connected,
    /// `disconnected`
    Disconnected,
    /// `error`
    Error,
    /// `message`
    Message,
    /// `reconnect_failed`
    ReconnectFailed,
    /// A typed event for one message tag.
    Tag(MessageType),
}

impl EventName {
    /// Resolve a string name. Lifecycle names win; anything else is a tag.
    pub fn parse(name: &str) -> Self {
        match name {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "error" => Self::Error,
            "message" => Self::Message,
            "reconnect_failed" => Self::ReconnectFailed,
            tag => Self::Tag(MessageType::from_tag(tag)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Message => "message",
            Self::ReconnectFailed => "reconnect_failed",
            Self::Tag(tag) => tag.as_str(),
        }
    }

    /// Names that stem from socket activity and must stop once the
    /// connection is intentionally closed.
    pub(crate) fn is_inbound(&self) -> bool {
        matches!(self, Self::Connected | Self::Message | Self::Tag(_))
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<MessageType> for EventName {
    fn from(tag: MessageType) -> Self {
        Self::Tag(tag)
    }
}
