//! Outbound notifications.
//!
//! Every notification carries an id, a type, the originating username and an
//! RFC 3339 timestamp. Server-originated notifications use the reserved
//! username [`SYSTEM_USERNAME`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use uuid::Uuid;

use crate::envelope::TypingStatus;

/// Username attached to server-originated notifications.
pub const SYSTEM_USERNAME: &str = "system";

/// Notification type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    System,
    ChatMessage,
    UserConnected,
    UserDisconnected,
    UserJoined,
    UserLeft,
    RoomJoined,
    RoomLeft,
    Typing,
    OnlineUsers,
    Error,
    Pong,
}

impl NotificationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::System => "system",
            NotificationType::ChatMessage => "chat_message",
            NotificationType::UserConnected => "user_connected",
            NotificationType::UserDisconnected => "user_disconnected",
            NotificationType::UserJoined => "user_joined",
            NotificationType::UserLeft => "user_left",
            NotificationType::RoomJoined => "room_joined",
            NotificationType::RoomLeft => "room_left",
            NotificationType::Typing => "typing",
            NotificationType::OnlineUsers => "online_users",
            NotificationType::Error => "error",
            NotificationType::Pong => "pong",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic information about an online user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u64,
    pub username: String,
    /// Always `"online"` for live presence.
    pub status: String,
}

impl UserInfo {
    /// Presence entry for a connected user.
    #[must_use]
    pub fn online(id: u64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            status: "online".to_string(),
        }
    }
}

/// A server-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique notification identifier.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    /// Originating user, or [`SYSTEM_USERNAME`].
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_username: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Notification {
    /// Create a notification with a fresh id and the current time.
    #[must_use]
    pub fn new(kind: NotificationType, username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: None,
            user_id: None,
            username: username.into(),
            room_id: None,
            recipient_username: None,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// A server-originated informational message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(NotificationType::System, SYSTEM_USERNAME).with_content(content)
    }

    /// A server-originated error message.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(NotificationType::Error, SYSTEM_USERNAME).with_content(content)
    }

    /// Reply to a client `ping`.
    #[must_use]
    pub fn pong(username: impl Into<String>) -> Self {
        Self::new(NotificationType::Pong, username)
    }

    /// Snapshot of every online user.
    #[must_use]
    pub fn online_users(users: &[UserInfo]) -> Self {
        Self::new(NotificationType::OnlineUsers, SYSTEM_USERNAME).with_data(json!({
            "users": users,
            "count": users.len(),
        }))
    }

    /// Typing indicator relayed to a room.
    #[must_use]
    pub fn typing(
        user_id: u64,
        username: impl Into<String>,
        room_id: Option<&str>,
        status: TypingStatus,
    ) -> Self {
        let mut notification = Self::new(NotificationType::Typing, username)
            .with_user_id(user_id)
            .with_data(json!({ "status": status.as_str() }));
        notification.room_id = room_id.map(str::to_string);
        notification
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
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

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_omitted() {
        let value = serde_json::to_value(Notification::pong("alice")).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object["type"], "pong");
        assert_eq!(object["username"], "alice");
        assert!(object.contains_key("id"));
        assert!(object.contains_key("timestamp"));
        assert!(!object.contains_key("content"));
        assert!(!object.contains_key("room_id"));
        assert!(!object.contains_key("data"));
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let value = serde_json::to_value(Notification::system("hello")).unwrap();
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_unique_ids() {
        let a = Notification::system("a");
        let b = Notification::system("a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_online_users_snapshot() {
        let users = vec![UserInfo::online(1, "alice"), UserInfo::online(2, "bob")];
        let notification = Notification::online_users(&users);

        assert_eq!(notification.kind, NotificationType::OnlineUsers);
        let data = notification.data.unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["users"][1]["username"], "bob");
        assert_eq!(data["users"][0]["status"], "online");
    }

    #[test]
    fn test_typing_marker() {
        let notification = Notification::typing(7, "alice", Some("general"), TypingStatus::Stop);
        assert_eq!(notification.user_id, Some(7));
        assert_eq!(notification.room_id.as_deref(), Some("general"));
        assert_eq!(notification.data.unwrap()["status"], "stop");
    }
}
