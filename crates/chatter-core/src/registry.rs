//! The hub's canonical state.
//!
//! The registry holds the live connections, the username map (presence) and
//! the room map. Every mutation keeps a connection's own room set and the room
//! member sets in agreement, and drops rooms as soon as they are empty.

use chatter_protocol::UserInfo;
use chatter_transport::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Identity;
use crate::presence::{Presence, PresenceEntry};
use crate::room::{Room, RoomId};

/// Hub-side record of one live connection.
#[derive(Debug)]
pub struct ClientEntry {
    pub id: ConnectionId,
    pub identity: Identity,
    /// Strong end of the outbound queue. Dropping it closes the queue.
    pub sender: mpsc::Sender<Arc<str>>,
    /// Rooms this connection belongs to.
    pub rooms: HashSet<RoomId>,
    /// Stops the connection's loops.
    pub cancel: CancellationToken,
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    UnknownConnection,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Left the room; `remaining` members are still in it.
    Left { remaining: usize },
    NotMember,
    UnknownConnection,
}

#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<ConnectionId, ClientEntry>,
    presence: Presence,
    rooms: HashMap<RoomId, Room>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&ClientEntry> {
        self.clients.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.contains_key(&id)
    }

    /// The connection currently owning `username`.
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<ConnectionId> {
        self.presence.lookup(username)
    }

    /// Add a connection. The caller must have evicted any previous owner of
    /// the username first.
    pub fn insert(&mut self, entry: ClientEntry) {
        let previous = self.presence.claim(
            entry.identity.username.clone(),
            PresenceEntry {
                connection: entry.id,
                user_id: entry.identity.user_id,
            },
        );
        debug_assert!(previous.is_none(), "username claimed twice");
        self.clients.insert(entry.id, entry);
    }

    /// Remove a connection from every map it appears in.
    ///
    /// Returns the entry so the caller decides when the outbound queue closes.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ClientEntry> {
        let entry = self.clients.remove(&id)?;
        self.presence.release(&entry.identity.username, id);

        for room_id in &entry.rooms {
            if let Some(room) = self.rooms.get_mut(room_id) {
                room.leave(id);
                if room.is_empty() {
                    self.rooms.remove(room_id);
                    debug!(room = %room_id, "Deleted empty room");
                }
            }
        }

        Some(entry)
    }

    pub fn join(&mut self, id: ConnectionId, room_id: &str) -> JoinOutcome {
        let Some(entry) = self.clients.get_mut(&id) else {
            return JoinOutcome::UnknownConnection;
        };
        if !entry.rooms.insert(room_id.to_string()) {
            return JoinOutcome::AlreadyMember;
        }

        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = %room_id, "Creating new room");
                Room::new(room_id)
            })
            .join(id);

        JoinOutcome::Joined
    }

    pub fn leave(&mut self, id: ConnectionId, room_id: &str) -> LeaveOutcome {
        let Some(entry) = self.clients.get_mut(&id) else {
            return LeaveOutcome::UnknownConnection;
        };
        if !entry.rooms.remove(room_id) {
            return LeaveOutcome::NotMember;
        }

        let remaining = match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.leave(id);
                room.member_count()
            }
            None => 0,
        };
        if remaining == 0 {
            self.rooms.remove(room_id);
            debug!(room = %room_id, "Deleted empty room");
        }

        LeaveOutcome::Left { remaining }
    }

    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.clients.keys().copied()
    }

    /// Usernames of a room's members, sorted, or `None` if the room does not exist.
    #[must_use]
    pub fn room_members(&self, room_id: &str) -> Option<Vec<String>> {
        let room = self.rooms.get(room_id)?;
        let mut names: Vec<String> = room
            .members()
            .filter_map(|id| self.clients.get(&id))
            .map(|entry| entry.identity.username.clone())
            .collect();
        names.sort();
        Some(names)
    }

    /// Rooms a connection belongs to, sorted, or `None` if it is not live.
    #[must_use]
    pub fn connection_rooms(&self, id: ConnectionId) -> Option<Vec<String>> {
        let entry = self.clients.get(&id)?;
        let mut rooms: Vec<String> = entry.rooms.iter().cloned().collect();
        rooms.sort();
        Some(rooms)
    }

    /// Online users, computed from the username map.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserInfo> {
        self.presence.snapshot()
    }

    /// Remove every connection, returning them in no particular order.
    pub fn drain(&mut self) -> Vec<ClientEntry> {
        self.rooms.clear();
        self.presence = Presence::new();
        self.clients.drain().map(|(_, entry)| entry).collect()
    }

    /// Check the membership and presence invariants.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (id, entry) in &self.clients {
            assert_eq!(self.presence.lookup(&entry.identity.username), Some(*id));
            for room_id in &entry.rooms {
                let room = self.rooms.get(room_id).expect("room in client set must exist");
                assert!(room.is_member(*id));
            }
        }
        for (room_id, room) in &self.rooms {
            assert!(!room.is_empty(), "empty room {room_id} not pruned");
            for id in room.members() {
                let entry = self.clients.get(&id).expect("room member must be live");
                assert!(entry.rooms.contains(room_id));
            }
        }
        assert_eq!(self.presence.count(), self.clients.len());
    }
}
