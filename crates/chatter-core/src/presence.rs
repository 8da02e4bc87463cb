//! Presence tracking for Chatter.
//!
//! Presence is the username → connection map. The online-users view is built
//! from it on every query and never cached, so it always reflects the last
//! completed register/unregister step.

use chatter_protocol::UserInfo;
use chatter_transport::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// The live connection that owns a username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection: ConnectionId,
    pub user_id: u64,
}

/// Username → live connection map.
#[derive(Debug, Default)]
pub struct Presence {
    by_username: HashMap<String, PresenceEntry>,
}

impl Presence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of online users.
    #[must_use]
    pub fn count(&self) -> usize {
        self.by_username.len()
    }

    /// The connection currently owning `username`.
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<ConnectionId> {
        self.by_username.get(username).map(|e| e.connection)
    }

    /// Bind a username to a connection.
    ///
    /// Returns the previous owner, if any.
    pub fn claim(&mut self, username: impl Into<String>, entry: PresenceEntry) -> Option<PresenceEntry> {
        let username = username.into();
        debug!(username = %username, connection = %entry.connection, "Presence: user online");
        self.by_username.insert(username, entry)
    }

    /// Release a username, but only if `connection` still owns it.
    ///
    /// Returns `true` if the username was released.
    pub fn release(&mut self, username: &str, connection: ConnectionId) -> bool {
        match self.by_username.get(username) {
            Some(entry) if entry.connection == connection => {
                self.by_username.remove(username);
                debug!(username = %username, connection = %connection, "Presence: user offline");
                true
            }
            _ => false,
        }
    }

    /// Online users, sorted by username.
    #[must_use]
    pub fn snapshot(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .by_username
            .iter()
            .map(|(username, entry)| UserInfo::online(entry.user_id, username.clone()))
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }
}
