//! Routing instructions for the hub.

use chatter_protocol::Notification;

/// Who a dispatch is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every live connection.
    All,
    /// Every member of a room. An empty room id means [`Target::All`].
    Room(String),
    /// The single connection owning a username.
    Private(String),
}

/// A notification plus the routing needed to fan it out.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub notification: Notification,
    pub target: Target,
    /// Username that must not receive this dispatch.
    pub exclude: Option<String>,
}

impl Dispatch {
    #[must_use]
    pub fn all(notification: Notification) -> Self {
        Self {
            notification,
            target: Target::All,
            exclude: None,
        }
    }

    #[must_use]
    pub fn room(room_id: impl Into<String>, notification: Notification) -> Self {
        Self {
            notification,
            target: Target::Room(room_id.into()),
            exclude: None,
        }
    }

    #[must_use]
    pub fn private(username: impl Into<String>, notification: Notification) -> Self {
        Self {
            notification,
            target: Target::Private(username.into()),
            exclude: None,
        }
    }

    /// Skip the connection owned by `username`.
    #[must_use]
    pub fn excluding(mut self, username: impl Into<String>) -> Self {
        self.exclude = Some(username.into());
        self
    }

    /// The target with an empty room id resolved to [`Target::All`].
    #[must_use]
    pub fn effective_target(&self) -> &Target {
        match &self.target {
            Target::Room(room) if room.is_empty() => &Target::All,
            target => target,
        }
    }
}
