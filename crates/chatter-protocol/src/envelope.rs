//! Inbound envelopes.
//!
//! An envelope is a parsed client request. The `type` field is kept as a raw
//! string so that an unknown type still parses and can be answered with an
//! `error` notification instead of dropping the frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    ChatMessage,
    JoinRoom,
    LeaveRoom,
    PrivateMessage,
    Typing,
    Ping,
}

impl EnvelopeType {
    /// Wire name of this envelope type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::ChatMessage => "chat_message",
            EnvelopeType::JoinRoom => "join_room",
            EnvelopeType::LeaveRoom => "leave_room",
            EnvelopeType::PrivateMessage => "private_message",
            EnvelopeType::Typing => "typing",
            EnvelopeType::Ping => "ping",
        }
    }
}

impl TryFrom<&str> for EnvelopeType {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "chat_message" => Ok(EnvelopeType::ChatMessage),
            "join_room" => Ok(EnvelopeType::JoinRoom),
            "leave_room" => Ok(EnvelopeType::LeaveRoom),
            "private_message" => Ok(EnvelopeType::PrivateMessage),
            "typing" => Ok(EnvelopeType::Typing),
            "ping" => Ok(EnvelopeType::Ping),
            _ => Err("Unknown envelope type"),
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound client request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw request type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Target room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Target user for private messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_username: Option<String>,
}

impl Envelope {
    /// Create an envelope of the given type with no fields set.
    #[must_use]
    pub fn new(kind: EnvelopeType) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, username: impl Into<String>) -> Self {
        self.recipient_username = Some(username.into());
        self
    }

    /// Resolve the request type, or `None` if it is not recognized.
    #[must_use]
    pub fn envelope_type(&self) -> Option<EnvelopeType> {
        EnvelopeType::try_from(self.kind.as_str()).ok()
    }

    /// Non-empty content, if present.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        non_empty(&self.content)
    }

    /// Non-empty room id, if present.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        non_empty(&self.room_id)
    }

    /// Non-empty recipient username, if present.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        non_empty(&self.recipient_username)
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Typing indicator marker carried in `typing` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingStatus {
    Start,
    Stop,
}

impl TypingStatus {
    /// Interpret the content of a `typing` envelope. Only `"stop"` stops.
    #[must_use]
    pub fn from_content(content: Option<&str>) -> Self {
        match content {
            Some(c) if c.eq_ignore_ascii_case("stop") => TypingStatus::Stop,
            _ => TypingStatus::Start,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TypingStatus::Start => "start",
            TypingStatus::Stop => "stop",
        }
    }
}
