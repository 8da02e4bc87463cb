//! The delivery hub.
//!
//! The hub owns the [`Registry`] and is its only writer. Connections talk to
//! it through a cloneable [`HubHandle`]; every registration, membership change
//! and dispatch is a [`Command`] processed one at a time, in arrival order, by
//! [`Hub::run`].
//!
//! Delivery never blocks: a notification is encoded once and offered to each
//! recipient's bounded outbound queue with `try_send`. A recipient whose queue
//! is full (or already closed) is evicted on the spot.

use chatter_protocol::{codec, Notification, NotificationType, UserInfo};
use chatter_transport::ConnectionId;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::Identity;
use crate::dispatch::{Dispatch, Target};
use crate::registry::{ClientEntry, JoinOutcome, LeaveOutcome, Registry};
use crate::room::validate_room_id;

/// Hub errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("Hub is closed")]
    Closed,

    /// The hub is shutting down and no longer admits connections.
    #[error("Hub is shutting down")]
    ShuttingDown,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the command channel.
    pub command_capacity: usize,
    /// Message sent to every connection when the hub shuts down.
    pub shutdown_message: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            shutdown_message: "Server shutting down".to_string(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of live connections.
    pub connections: usize,
    /// Number of non-empty rooms.
    pub rooms: usize,
    /// Notifications successfully enqueued since start.
    pub deliveries: u64,
    /// Connections evicted because their queue was full or closed.
    pub evictions: u64,
}

/// Everything the hub needs to admit a connection.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub identity: Identity,
    /// The only strong sender of the connection's outbound queue.
    pub sender: mpsc::Sender<Arc<str>>,
    pub cancel: CancellationToken,
}

/// Read-only queries answered inside the command loop.
#[derive(Debug)]
pub enum Query {
    OnlineUsers(oneshot::Sender<Vec<UserInfo>>),
    RoomMembers(String, oneshot::Sender<Option<Vec<String>>>),
    ConnectionRooms(ConnectionId, oneshot::Sender<Option<Vec<String>>>),
    Stats(oneshot::Sender<HubStats>),
}

/// A unit of work for the hub loop.
#[derive(Debug)]
pub enum Command {
    Register {
        registration: Registration,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister(ConnectionId),
    Dispatch(Dispatch),
    Join { id: ConnectionId, room: String },
    Leave { id: ConnectionId, room: String },
    Query(Query),
}

/// Cloneable handle for submitting commands to a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

impl HubHandle {
    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Query(make(tx))).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Admit a connection and wait until the hub has processed it.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShuttingDown`] once shutdown has begun, or
    /// [`HubError::Closed`] if the hub loop is gone.
    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            registration,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Request removal of a connection. Removing an absent connection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister(id)).await
    }

    /// Fan out a notification.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn dispatch(&self, dispatch: Dispatch) -> Result<(), HubError> {
        self.send(Command::Dispatch(dispatch)).await
    }

    /// Add a connection to a room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn join(&self, id: ConnectionId, room: impl Into<String>) -> Result<(), HubError> {
        self.send(Command::Join {
            id,
            room: room.into(),
        })
        .await
    }

    /// Remove a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn leave(&self, id: ConnectionId, room: impl Into<String>) -> Result<(), HubError> {
        self.send(Command::Leave {
            id,
            room: room.into(),
        })
        .await
    }

    /// Online users, sorted by username.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn online_users(&self) -> Result<Vec<UserInfo>, HubError> {
        self.query(Query::OnlineUsers).await
    }

    /// Usernames in a room, or `None` if the room does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn room_members(&self, room: impl Into<String>) -> Result<Option<Vec<String>>, HubError> {
        let room = room.into();
        self.query(|tx| Query::RoomMembers(room, tx)).await
    }

    /// Whether a room currently has members.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn room_exists(&self, room: impl Into<String>) -> Result<bool, HubError> {
        Ok(self.room_members(room).await?.is_some())
    }

    /// Rooms a connection belongs to, or `None` if it is not live.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn connection_rooms(&self, id: ConnectionId) -> Result<Option<Vec<String>>, HubError> {
        self.query(|tx| Query::ConnectionRooms(id, tx)).await
    }

    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop is gone.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.query(Query::Stats).await
    }

    /// A token that is cancelled when the hub shuts down.
    #[must_use]
    pub fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Begin cooperative shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The hub command loop.
pub struct Hub {
    registry: Registry,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    config: HubConfig,
    /// Connections whose delivery failed, awaiting removal.
    evictions: VecDeque<ConnectionId>,
    deliveries: u64,
    evicted: u64,
}

impl Hub {
    /// Create a hub and its handle. The hub stops when `shutdown` is cancelled.
    #[must_use]
    pub fn new(config: HubConfig, shutdown: CancellationToken) -> (Self, HubHandle) {
        info!("Creating hub with config: {:?}", config);
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let handle = HubHandle {
            commands: tx,
            shutdown: shutdown.clone(),
        };
        let hub = Self {
            registry: Registry::new(),
            commands: rx,
            shutdown,
            config,
            evictions: VecDeque::new(),
            deliveries: 0,
            evicted: 0,
        };
        (hub, handle)
    }

    /// Create a hub with default configuration and spawn its loop.
    #[must_use]
    pub fn spawn(shutdown: CancellationToken) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (hub, handle) = Self::new(HubConfig::default(), shutdown);
        (handle, tokio::spawn(hub.run()))
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Hub loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        self.close_all();
        info!("Hub loop stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                registration,
                reply,
            } => {
                self.register(registration);
                let _ = reply.send(Ok(()));
            }
            Command::Unregister(id) => self.unregister(id, "connection closed"),
            Command::Dispatch(dispatch) => self.dispatch(dispatch),
            Command::Join { id, room } => self.join(id, &room),
            Command::Leave { id, room } => self.leave(id, &room),
            Command::Query(query) => self.answer(query),
        }
        self.flush_evictions();
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            identity,
            sender,
            cancel,
        } = registration;

        if let Some(existing) = self.registry.lookup(&identity.username) {
            warn!(
                username = %identity.username,
                old = %existing,
                new = %id,
                "Duplicate login, evicting previous connection"
            );
            self.unregister(existing, "duplicate login");
        }

        self.registry.insert(ClientEntry {
            id,
            identity: identity.clone(),
            sender,
            rooms: HashSet::new(),
            cancel,
        });
        info!(
            connection = %id,
            username = %identity.username,
            user_id = identity.user_id,
            online = self.registry.connection_count(),
            "Connection registered"
        );

        let welcome = Notification::system(format!("Welcome to the chat, {}!", identity.username));
        self.send_to(id, &welcome);
        let snapshot = Notification::online_users(&self.registry.online_users());
        self.send_to(id, &snapshot);

        let connected = Notification::new(NotificationType::UserConnected, &identity.username)
            .with_user_id(identity.user_id)
            .with_content(format!("{} connected", identity.username));
        self.dispatch(Dispatch::all(connected).excluding(&identity.username));
    }

    fn unregister(&mut self, id: ConnectionId, reason: &str) {
        let Some(entry) = self.registry.remove(id) else {
            trace!(connection = %id, "Unregister of absent connection ignored");
            return;
        };
        entry.cancel.cancel();
        let identity = entry.identity.clone();
        // Dropping the entry drops the last strong sender and closes the queue.
        drop(entry);

        info!(
            connection = %id,
            username = %identity.username,
            reason,
            online = self.registry.connection_count(),
            "Connection unregistered"
        );

        let disconnected =
            Notification::new(NotificationType::UserDisconnected, &identity.username)
                .with_user_id(identity.user_id)
                .with_content(format!("{} disconnected", identity.username));
        self.dispatch(Dispatch::all(disconnected).excluding(&identity.username));
    }

    fn join(&mut self, id: ConnectionId, room: &str) {
        let Some(identity) = self.registry.get(id).map(|e| e.identity.clone()) else {
            debug!(connection = %id, room = %room, "Join from absent connection ignored");
            return;
        };
        if let Err(reason) = validate_room_id(room) {
            self.send_to(id, &Notification::error(reason));
            return;
        }

        let outcome = self.registry.join(id, room);
        debug!(connection = %id, room = %room, ?outcome, "Join");

        let joined = Notification::new(NotificationType::RoomJoined, &identity.username)
            .with_user_id(identity.user_id)
            .with_room(room)
            .with_content(format!("You joined room {room}"));
        self.send_to(id, &joined);

        if outcome == JoinOutcome::Joined {
            let notice = Notification::new(NotificationType::UserJoined, &identity.username)
                .with_user_id(identity.user_id)
                .with_room(room)
                .with_content(format!("{} joined the room", identity.username));
            self.dispatch(Dispatch::room(room, notice).excluding(&identity.username));
        }
    }

    fn leave(&mut self, id: ConnectionId, room: &str) {
        let Some(identity) = self.registry.get(id).map(|e| e.identity.clone()) else {
            debug!(connection = %id, room = %room, "Leave from absent connection ignored");
            return;
        };

        match self.registry.leave(id, room) {
            LeaveOutcome::Left { remaining } => {
                debug!(connection = %id, room = %room, remaining, "Leave");
                let left = Notification::new(NotificationType::RoomLeft, &identity.username)
                    .with_user_id(identity.user_id)
                    .with_room(room)
                    .with_content(format!("You left room {room}"));
                self.send_to(id, &left);

                if remaining > 0 {
                    let notice = Notification::new(NotificationType::UserLeft, &identity.username)
                        .with_user_id(identity.user_id)
                        .with_room(room)
                        .with_content(format!("{} left the room", identity.username));
                    self.dispatch(Dispatch::room(room, notice));
                }
            }
            LeaveOutcome::NotMember => {
                self.send_to(id, &Notification::error(format!("You are not in room {room}")));
            }
            LeaveOutcome::UnknownConnection => {}
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        let recipients: Vec<ConnectionId> = match dispatch.effective_target() {
            Target::All => self.registry.connection_ids().collect(),
            Target::Room(room) => match self.registry.room(room) {
                Some(room) => room.members().collect(),
                None => {
                    debug!(room = %room, "Dispatch to unknown room ignored");
                    return;
                }
            },
            Target::Private(username) => match self.registry.lookup(username) {
                Some(id) => vec![id],
                None => {
                    let sender = dispatch.notification.username.as_str();
                    debug!(recipient = %username, sender = %sender, "Private recipient offline");
                    if let Some(origin) = self.registry.lookup(sender) {
                        let error = Notification::error(format!("User '{username}' is not online"))
                            .with_recipient(username.as_str());
                        self.send_to(origin, &error);
                    }
                    return;
                }
            },
        };

        let excluded = dispatch
            .exclude
            .as_deref()
            .and_then(|username| self.registry.lookup(username));

        let Some(frame) = self.encode(&dispatch.notification) else {
            return;
        };
        let mut delivered = 0usize;
        for id in recipients {
            if Some(id) == excluded {
                continue;
            }
            if self.deliver(id, &frame) {
                delivered += 1;
            }
        }
        trace!(
            kind = %dispatch.notification.kind,
            recipients = delivered,
            "Dispatched notification"
        );
    }

    fn answer(&mut self, query: Query) {
        match query {
            Query::OnlineUsers(tx) => {
                let _ = tx.send(self.registry.online_users());
            }
            Query::RoomMembers(room, tx) => {
                let _ = tx.send(self.registry.room_members(&room));
            }
            Query::ConnectionRooms(id, tx) => {
                let _ = tx.send(self.registry.connection_rooms(id));
            }
            Query::Stats(tx) => {
                let _ = tx.send(self.stats());
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.connection_count(),
            rooms: self.registry.room_count(),
            deliveries: self.deliveries,
            evictions: self.evicted,
        }
    }

    fn encode(&self, notification: &Notification) -> Option<Arc<str>> {
        match codec::encode(notification) {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!(kind = %notification.kind, error = %e, "Failed to encode notification");
                None
            }
        }
    }

    fn send_to(&mut self, id: ConnectionId, notification: &Notification) {
        if let Some(frame) = self.encode(notification) {
            self.deliver(id, &frame);
        }
    }

    /// Offer a frame to one connection without waiting.
    ///
    /// A full or closed queue schedules the connection for eviction.
    fn deliver(&mut self, id: ConnectionId, frame: &Arc<str>) -> bool {
        let Some(entry) = self.registry.get(id) else {
            return false;
        };
        match entry.sender.try_send(Arc::clone(frame)) {
            Ok(()) => {
                self.deliveries += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %id, username = %entry.identity.username, "Outbound queue full, evicting");
                self.evictions.push_back(id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = %id, "Outbound queue closed, evicting");
                self.evictions.push_back(id);
                false
            }
        }
    }

    fn flush_evictions(&mut self) {
        while let Some(id) = self.evictions.pop_front() {
            if self.registry.contains(id) {
                self.evicted += 1;
                self.unregister(id, "slow consumer");
            }
        }
    }

    fn close_all(&mut self) {
        let count = self.registry.connection_count();
        if count > 0 {
            let notice = Notification::system(self.config.shutdown_message.clone());
            self.dispatch(Dispatch::all(notice));
        }
        for entry in self.registry.drain() {
            entry.cancel.cancel();
        }
        self.evictions.clear();
        info!(connections = count, "Closed all outbound queues");
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    struct TestClient {
        id: ConnectionId,
        rx: mpsc::Receiver<Arc<str>>,
        cancel: CancellationToken,
    }

    impl TestClient {
        fn drain(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn kinds(&mut self) -> Vec<NotificationType> {
            self.drain().into_iter().map(|n| n.kind).collect()
        }

        fn is_closed(&mut self) -> bool {
            matches!(
                self.rx.try_recv(),
                Err(mpsc::error::TryRecvError::Disconnected)
            )
        }
    }

    fn registration(user_id: u64, username: &str, capacity: usize) -> (Registration, TestClient) {
        let (sender, rx) = mpsc::channel(capacity);
        let id = ConnectionId::generate();
        let cancel = CancellationToken::new();
        (
            Registration {
                id,
                identity: Identity::new(user_id, username),
                sender,
                cancel: cancel.clone(),
            },
            TestClient { id, rx, cancel },
        )
    }

    /// Drive a hub synchronously, without spawning its loop.
    fn hub() -> Hub {
        Hub::new(HubConfig::default(), CancellationToken::new()).0
    }

    fn connect(hub: &mut Hub, user_id: u64, username: &str) -> TestClient {
        connect_with_capacity(hub, user_id, username, 64)
    }

    fn connect_with_capacity(hub: &mut Hub, user_id: u64, username: &str, capacity: usize) -> TestClient {
        let (registration, client) = registration(user_id, username, capacity);
        let (reply, _rx) = oneshot::channel();
        hub.handle(Command::Register {
            registration,
            reply,
        });
        client
    }

    fn chat(username: &str, content: &str) -> Notification {
        Notification::new(NotificationType::ChatMessage, username).with_content(content)
    }

    #[test]
    fn test_register_sends_welcome_and_snapshot() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");

        let received = alice.drain();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kind, NotificationType::System);
        assert_eq!(received[1].kind, NotificationType::OnlineUsers);
        assert_eq!(received[1].data.as_ref().unwrap()["count"], 1);

        let mut bob = connect(&mut hub, 2, "bob");
        assert_eq!(alice.kinds(), vec![NotificationType::UserConnected]);
        let snapshot = bob.drain().pop().unwrap();
        assert_eq!(snapshot.data.unwrap()["count"], 2);
    }

    #[test]
    fn test_duplicate_login_evicts_previous() {
        let mut hub = hub();
        let mut first = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        first.drain();
        bob.drain();

        let mut second = connect(&mut hub, 1, "alice");

        assert!(first.cancel.is_cancelled());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        let users = hub.registry().online_users();
        assert_eq!(users.iter().filter(|u| u.username == "alice").count(), 1);
        assert_eq!(hub.registry().lookup("alice"), Some(second.id));
        assert_eq!(
            bob.kinds(),
            vec![
                NotificationType::UserDisconnected,
                NotificationType::UserConnected
            ]
        );
        hub.registry().assert_consistent();
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let bob = connect(&mut hub, 2, "bob");
        alice.drain();

        hub.handle(Command::Unregister(bob.id));
        assert_eq!(alice.kinds(), vec![NotificationType::UserDisconnected]);

        hub.handle(Command::Unregister(bob.id));
        hub.handle(Command::Unregister(ConnectionId(u64::MAX)));
        assert!(alice.drain().is_empty());
        assert_eq!(hub.stats().connections, 1);
    }

    #[test]
    fn test_room_dispatch_respects_exclusion() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        hub.handle(Command::Join { id: alice.id, room: "general".into() });
        hub.handle(Command::Join { id: bob.id, room: "general".into() });
        alice.drain();
        bob.drain();

        hub.handle(Command::Dispatch(
            Dispatch::room("general", chat("alice", "typing")).excluding("alice"),
        ));
        assert!(alice.drain().is_empty());
        assert_eq!(bob.kinds(), vec![NotificationType::ChatMessage]);
    }

    #[test]
    fn test_join_notifies_joiner_and_members() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        hub.handle(Command::Join { id: alice.id, room: "general".into() });
        alice.drain();
        bob.drain();

        hub.handle(Command::Join { id: bob.id, room: "general".into() });
        assert_eq!(bob.kinds(), vec![NotificationType::RoomJoined]);
        let notices = alice.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].kind, NotificationType::UserJoined);
        assert_eq!(notices[0].username, "bob");
        assert_eq!(notices[0].room_id.as_deref(), Some("general"));

        hub.handle(Command::Join { id: bob.id, room: "general".into() });
        assert_eq!(bob.kinds(), vec![NotificationType::RoomJoined]);
        assert!(alice.drain().is_empty());
        hub.registry().assert_consistent();
    }

    #[test]
    fn test_join_rejects_invalid_room() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        alice.drain();

        hub.handle(Command::Join { id: alice.id, room: "bad\u{7}room".into() });
        assert_eq!(alice.kinds(), vec![NotificationType::Error]);
        assert_eq!(hub.stats().rooms, 0);
    }

    #[test]
    fn test_leave_prunes_room_and_notifies_remaining() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        hub.handle(Command::Join { id: alice.id, room: "x".into() });
        hub.handle(Command::Join { id: bob.id, room: "x".into() });
        alice.drain();
        bob.drain();

        hub.handle(Command::Leave { id: alice.id, room: "x".into() });
        assert_eq!(alice.kinds(), vec![NotificationType::RoomLeft]);
        assert_eq!(bob.kinds(), vec![NotificationType::UserLeft]);

        hub.handle(Command::Leave { id: bob.id, room: "x".into() });
        assert_eq!(bob.kinds(), vec![NotificationType::RoomLeft]);
        assert!(alice.drain().is_empty());
        assert!(hub.registry().room("x").is_none());

        hub.handle(Command::Dispatch(Dispatch::room("x", chat("bob", "anyone?"))));
        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());

        hub.handle(Command::Leave { id: bob.id, room: "x".into() });
        assert_eq!(bob.kinds(), vec![NotificationType::Error]);
    }

    #[test]
    fn test_empty_room_dispatch_reaches_everyone() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        alice.drain();
        bob.drain();

        hub.handle(Command::Dispatch(Dispatch::room("", chat("alice", "hello all"))));
        assert_eq!(alice.kinds(), vec![NotificationType::ChatMessage]);
        assert_eq!(bob.kinds(), vec![NotificationType::ChatMessage]);
    }

    #[test]
    fn test_private_dispatch() {
        let mut hub = hub();
        let mut alice = connect(&mut hub, 1, "alice");
        let mut bob = connect(&mut hub, 2, "bob");
        let mut carol = connect(&mut hub, 3, "carol");
        alice.drain();
        bob.drain();
        carol.drain();

        hub.handle(Command::Dispatch(Dispatch::private("bob", chat("alice", "hey"))));
        assert!(alice.drain().is_empty());
        assert_eq!(bob.kinds(), vec![NotificationType::ChatMessage]);
        assert!(carol.drain().is_empty());

        hub.handle(Command::Dispatch(Dispatch::private("dave", chat("alice", "hey"))));
        let errors = alice.drain();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, NotificationType::Error);
        assert_eq!(errors[0].recipient_username.as_deref(), Some("dave"));
        assert!(bob.drain().is_empty());
        assert!(carol.drain().is_empty());

        // Sender gone too: silently dropped.
        hub.handle(Command::Dispatch(Dispatch::private("dave", chat("zed", "hey"))));
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_full_queue_evicts_only_slow_consumer() {
        let mut hub = hub();
        let mut fast: Vec<TestClient> = (0..4)
            .map(|i| connect(&mut hub, i, &format!("user-{i}")))
            .collect();
        let mut slow = connect_with_capacity(&mut hub, 99, "slow", 2);
        // welcome + snapshot already fill the slow queue
        for client in &mut fast {
            client.drain();
        }

        hub.handle(Command::Dispatch(Dispatch::all(chat("user-0", "burst"))));

        for client in &mut fast {
            let kinds = client.kinds();
            assert_eq!(
                kinds,
                vec![NotificationType::ChatMessage, NotificationType::UserDisconnected]
            );
        }
        assert!(slow.cancel.is_cancelled());
        slow.drain();
        assert!(slow.is_closed());
        assert!(hub.registry().lookup("slow").is_none());
        assert_eq!(hub.stats().evictions, 1);
        assert_eq!(hub.stats().connections, 4);
    }

    #[test]
    fn test_registry_consistent_across_random_sequence() {
        let mut hub = hub();
        let names = ["a", "b", "c"];
        let rooms = ["r1", "r2"];
        let mut clients = Vec::new();
        for step in 0..60u64 {
            let name = names[(step % 3) as usize];
            match step % 5 {
                0 | 3 => clients.push(connect(&mut hub, step, name)),
                1 => {
                    if let Some(c) = clients.get(step as usize % clients.len().max(1)) {
                        let room = rooms[(step % 2) as usize].to_string();
                        hub.handle(Command::Join { id: c.id, room });
                    }
                }
                2 => {
                    if let Some(c) = clients.first() {
                        let room = rooms[(step % 2) as usize].to_string();
                        hub.handle(Command::Leave { id: c.id, room });
                    }
                }
                _ => {
                    if let Some(c) = clients.get(step as usize % clients.len().max(1)) {
                        hub.handle(Command::Unregister(c.id));
                    }
                }
            }
            for c in &mut clients {
                c.drain();
            }
            hub.registry().assert_consistent();
            let online = hub.registry().online_users();
            for name in names {
                assert!(online.iter().filter(|u| u.username == name).count() <= 1);
            }
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let shutdown = CancellationToken::new();
        let (handle, task) = Hub::spawn(shutdown.clone());

        let (registration, mut alice) = registration(1, "alice", 16);
        handle.register(registration).await.unwrap();
        handle.join(alice.id, "general").await.unwrap();

        assert_eq!(
            handle.room_members("general").await.unwrap(),
            Some(vec!["alice".to_string()])
        );
        assert_eq!(
            handle.connection_rooms(alice.id).await.unwrap(),
            Some(vec!["general".to_string()])
        );
        assert!(handle.room_exists("general").await.unwrap());
        assert!(!handle.room_exists("nowhere").await.unwrap());
        assert_eq!(handle.online_users().await.unwrap().len(), 1);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.rooms, 1);
        assert_eq!(alice.kinds().len(), 3);

        handle.shutdown();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues_and_rejects_registration() {
        let shutdown = CancellationToken::new();
        let (handle, task) = Hub::spawn(shutdown.clone());

        let (registration, mut alice) = registration(1, "alice", 16);
        handle.register(registration).await.unwrap();

        handle.shutdown();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let kinds = alice.kinds();
        assert_eq!(kinds.last(), Some(&NotificationType::System));
        assert!(alice.is_closed());
        assert!(alice.cancel.is_cancelled());

        let (late, _client) = self::registration(2, "bob", 16);
        assert_eq!(handle.register(late).await, Err(HubError::ShuttingDown));
        assert_eq!(handle.online_users().await, Err(HubError::Closed));
    }
}
