//! Room abstraction for Chatter.
//!
//! Rooms are named groups of connections. A room exists only while it has at
//! least one member; the registry prunes it as soon as the last member leaves.

use chatter_transport::ConnectionId;
use std::collections::HashSet;
use tracing::debug;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// The member set of one room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashSet<ConnectionId>,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, connection: ConnectionId) -> bool {
        self.members.contains(&connection)
    }

    /// Add a member.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&mut self, connection: ConnectionId) -> bool {
        let added = self.members.insert(connection);
        if added {
            debug!(room = %self.id, connection = %connection, "Connection joined room");
        }
        added
    }

    /// Remove a member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection: ConnectionId) -> bool {
        let removed = self.members.remove(&connection);
        if removed {
            debug!(room = %self.id, connection = %connection, "Connection left room");
        }
        removed
    }

    pub fn members(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
