//! Connection actor.
//!
//! A [`Connection`] owns one client transport for its whole life. It runs two
//! loops that share nothing but the outbound queue:
//!
//! - the reader parses inbound envelopes and turns them into hub commands,
//!   answering `ping` and validation errors locally;
//! - the writer drains the outbound queue to the transport and sends a
//!   liveness probe every ping interval.
//!
//! The hub holds the only strong sender of the outbound queue. When it drops
//! the connection's entry the queue closes, the writer sends a close frame and
//! both loops wind down. Whichever loop stops first requests exactly one
//! `unregister`.

use bytes::Bytes;
use chatter_protocol::{codec, Envelope, EnvelopeType, Notification, NotificationType, TypingStatus};
use chatter_transport::{ConnectionId, Frame, FrameSink, FrameStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, timeout_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::Dispatch;
use crate::hub::{HubError, HubHandle, Registration};

/// Default outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Default time allowed between liveness pongs.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default time a cancelled connection may keep flushing its transport.
pub const DEFAULT_WRITE_GRACE: Duration = Duration::from_secs(1);

/// An externally established client identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: u64,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: u64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_size: usize,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Once cancelled, how long the writer may keep flushing before it
    /// abandons the transport.
    pub write_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_size: codec::DEFAULT_MAX_FRAME_SIZE,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_interval: DEFAULT_PONG_WAIT * 9 / 10,
            write_grace: DEFAULT_WRITE_GRACE,
        }
    }
}

impl ConnectionConfig {
    /// Set the read deadline. The ping interval becomes 90% of it.
    #[must_use]
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_interval = pong_wait * 9 / 10;
        self
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_write_grace(mut self, write_grace: Duration) -> Self {
        self.write_grace = write_grace;
        self
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Created, not yet registered.
    Open,
    /// Registered and serving traffic.
    Active,
    /// A loop has stopped; teardown in progress.
    Draining,
    /// Both loops have exited.
    Closed,
}

/// A client connection actor.
pub struct Connection<S, R> {
    id: ConnectionId,
    identity: Identity,
    sink: S,
    stream: R,
    hub: HubHandle,
    config: ConnectionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl<S: FrameSink, R: FrameStream> Connection<S, R> {
    /// Create a connection over an already-split transport.
    pub fn new(identity: Identity, sink: S, stream: R, hub: HubHandle, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            id: ConnectionId::generate(),
            identity,
            sink,
            stream,
            hub,
            config,
            state: Arc::new(state),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Observe lifecycle transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Register with the hub and serve the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns the hub error if registration was refused. Once registered the
    /// connection always ends with `Ok`.
    pub async fn run(self) -> Result<(), HubError> {
        let Self {
            id,
            identity,
            mut sink,
            stream,
            hub,
            config,
            state,
        } = self;

        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let outbound = tx.downgrade();
        let cancel = hub.connection_token();

        let registration = Registration {
            id,
            identity: identity.clone(),
            sender: tx,
            cancel: cancel.clone(),
        };
        if let Err(e) = hub.register(registration).await {
            warn!(connection = %id, username = %identity.username, error = %e, "Registration refused");
            let _ = sink.send(Frame::Close).await;
            let _ = sink.close().await;
            state.send_replace(ConnectionState::Closed);
            return Err(e);
        }
        state.send_replace(ConnectionState::Active);
        debug!(connection = %id, username = %identity.username, "Connection active");

        let teardown = Arc::new(Teardown::new(id, hub.clone()));
        let writer = tokio::spawn(write_loop(
            id,
            sink,
            rx,
            config.ping_interval,
            config.write_grace,
            cancel.clone(),
            Arc::clone(&teardown),
        ));

        let mut reader = Reader {
            stream,
            cancel,
            max_frame_size: config.max_frame_size,
            pong_wait: config.pong_wait,
            inbound: Inbound {
                id,
                identity,
                hub,
                outbound,
            },
        };
        reader.run().await;

        state.send_replace(ConnectionState::Draining);
        teardown.fire().await;
        if let Err(e) = writer.await {
            error!(connection = %id, error = %e, "Writer task failed");
        }
        state.send_replace(ConnectionState::Closed);
        debug!(connection = %id, "Connection closed");
        Ok(())
    }
}

/// Sends the single `unregister` request for a connection.
struct Teardown {
    id: ConnectionId,
    hub: HubHandle,
    fired: AtomicBool,
}

impl Teardown {
    fn new(id: ConnectionId, hub: HubHandle) -> Self {
        Self {
            id,
            hub,
            fired: AtomicBool::new(false),
        }
    }

    async fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.hub.unregister(self.id).await {
            debug!(connection = %self.id, error = %e, "Unregister not delivered");
        }
    }
}

async fn write_loop<S: FrameSink>(
    id: ConnectionId,
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<str>>,
    ping_interval: Duration,
    write_grace: Duration,
    cancel: CancellationToken,
    teardown: Arc<Teardown>,
) {
    let period = ping_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Fires `write_grace` after cancellation. Never polled again once ready.
    let expired = async {
        cancel.cancelled().await;
        sleep(write_grace).await;
    };
    tokio::pin!(expired);

    loop {
        let frame = tokio::select! {
            biased;
            () = &mut expired => {
                debug!(connection = %id, "Write grace expired");
                break;
            }
            frame = rx.recv() => match frame {
                Some(text) => Frame::Text(text.to_string()),
                None => {
                    trace!(connection = %id, "Outbound queue closed");
                    Frame::Close
                }
            },
            _ = ticker.tick(), if !cancel.is_cancelled() => Frame::Ping(Bytes::new()),
        };

        let closing = frame == Frame::Close;
        tokio::select! {
            biased;
            sent = sink.send(frame) => {
                if let Err(e) = sent {
                    debug!(connection = %id, error = %e, "Write failed");
                    break;
                }
            }
            () = &mut expired => {
                debug!(connection = %id, "Write grace expired with a write pending");
                break;
            }
        }
        if closing {
            break;
        }
    }

    if timeout(write_grace, sink.close()).await.is_err() {
        debug!(connection = %id, "Transport close timed out");
    }
    cancel.cancel();
    teardown.fire().await;
}

struct Reader<R> {
    stream: R,
    cancel: CancellationToken,
    max_frame_size: usize,
    pong_wait: Duration,
    inbound: Inbound,
}

impl<R: FrameStream> Reader<R> {
    async fn run(&mut self) {
        let id = self.inbound.id;
        let mut deadline = Instant::now() + self.pong_wait;

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(connection = %id, "Reader cancelled");
                    break;
                }
                received = timeout_at(deadline, self.stream.recv()) => received,
            };

            let frame = match received {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    debug!(connection = %id, "Stream ended");
                    break;
                }
                Ok(Err(e)) => {
                    debug!(connection = %id, error = %e, "Read failed");
                    break;
                }
                Err(_) => {
                    info!(connection = %id, username = %self.inbound.identity.username, "Read deadline expired");
                    break;
                }
            };

            if let Err(e) = codec::check_frame_size(frame.len(), self.max_frame_size) {
                warn!(connection = %id, error = %e, "Closing connection");
                break;
            }

            let handled = match frame {
                Frame::Text(text) => self.inbound.handle_payload(codec::decode(&text)).await,
                Frame::Binary(data) => self.inbound.handle_payload(codec::decode_bytes(&data)).await,
                Frame::Pong(_) => {
                    deadline = Instant::now() + self.pong_wait;
                    Ok(())
                }
                Frame::Ping(_) => Ok(()),
                Frame::Close => {
                    debug!(connection = %id, "Received close frame");
                    break;
                }
            };

            if let Err(e) = handled {
                debug!(connection = %id, error = %e, "Hub unavailable");
                break;
            }
        }
    }
}

/// Envelope handling for one connection.
struct Inbound {
    id: ConnectionId,
    identity: Identity,
    hub: HubHandle,
    /// Weak end of the outbound queue, for replies that bypass the hub.
    outbound: mpsc::WeakSender<Arc<str>>,
}

impl Inbound {
    async fn handle_payload(
        &self,
        decoded: Result<Envelope, chatter_protocol::ProtocolError>,
    ) -> Result<(), HubError> {
        match decoded {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => {
                debug!(connection = %self.id, error = %e, "Malformed envelope");
                self.reply(&Notification::error("Invalid message format"));
                Ok(())
            }
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) -> Result<(), HubError> {
        let Some(kind) = envelope.envelope_type() else {
            debug!(connection = %self.id, kind = %envelope.kind, "Unknown envelope type");
            self.reply(&Notification::error(format!("Unknown message type: {}", envelope.kind)));
            return Ok(());
        };
        trace!(connection = %self.id, kind = %kind, "Envelope");

        let Identity { user_id, username } = &self.identity;

        match kind {
            EnvelopeType::ChatMessage => {
                let Some(content) = envelope.content() else {
                    self.reply(&Notification::error("Message content is required"));
                    return Ok(());
                };
                let room = envelope.room_id().unwrap_or_default();
                let mut notification = Notification::new(NotificationType::ChatMessage, username)
                    .with_user_id(*user_id)
                    .with_content(content);
                if !room.is_empty() {
                    notification = notification.with_room(room);
                }
                self.hub.dispatch(Dispatch::room(room, notification)).await
            }
            EnvelopeType::JoinRoom => match envelope.room_id() {
                Some(room) => self.hub.join(self.id, room).await,
                None => {
                    self.reply(&Notification::error("Room ID is required"));
                    Ok(())
                }
            },
            EnvelopeType::LeaveRoom => match envelope.room_id() {
                Some(room) => self.hub.leave(self.id, room).await,
                None => {
                    self.reply(&Notification::error("Room ID is required"));
                    Ok(())
                }
            },
            EnvelopeType::PrivateMessage => {
                let (Some(recipient), Some(content)) = (envelope.recipient(), envelope.content())
                else {
                    self.reply(&Notification::error("Recipient and content are required"));
                    return Ok(());
                };
                let notification = Notification::new(NotificationType::ChatMessage, username)
                    .with_user_id(*user_id)
                    .with_content(content)
                    .with_recipient(recipient);
                self.reply(&notification);
                self.hub
                    .dispatch(Dispatch::private(recipient, notification))
                    .await
            }
            EnvelopeType::Typing => {
                let status = TypingStatus::from_content(envelope.content.as_deref());
                let room = envelope.room_id();
                let notification = Notification::typing(*user_id, username, room, status);
                self.hub
                    .dispatch(Dispatch::room(room.unwrap_or_default(), notification).excluding(username))
                    .await
            }
            EnvelopeType::Ping => {
                self.reply(&Notification::pong(username));
                Ok(())
            }
        }
    }

    /// Enqueue a notification for this connection only.
    fn reply(&self, notification: &Notification) {
        let Some(sender) = self.outbound.upgrade() else {
            trace!(connection = %self.id, "Outbound queue closed, reply dropped");
            return;
        };
        match codec::encode(notification) {
            Ok(frame) => {
                if let Err(e) = sender.try_send(frame) {
                    warn!(connection = %self.id, kind = %notification.kind, error = %e, "Reply dropped");
                }
            }
            Err(e) => error!(connection = %self.id, error = %e, "Failed to encode reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use chatter_transport::memory::{self, MemoryPeer};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Next notification, skipping liveness probes.
    async fn next(peer: &mut MemoryPeer) -> Option<Notification> {
        loop {
            match timeout(WAIT, peer.recv()).await.ok()?? {
                Frame::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                Frame::Ping(_) => continue,
                _ => return None,
            }
        }
    }

    async fn expect(peer: &mut MemoryPeer, kind: NotificationType) -> Notification {
        let notification = next(peer).await.expect("connection closed");
        assert_eq!(notification.kind, kind, "unexpected {notification:?}");
        notification
    }

    fn start(
        hub: &HubHandle,
        username: &str,
        config: ConnectionConfig,
    ) -> (MemoryPeer, watch::Receiver<ConnectionState>, JoinHandle<Result<(), HubError>>) {
        let (sink, stream, peer) = memory::pair(64);
        let connection = Connection::new(Identity::new(1, username), sink, stream, hub.clone(), config);
        let state = connection.state();
        (peer, state, tokio::spawn(connection.run()))
    }

    async fn connected(hub: &HubHandle, username: &str) -> (MemoryPeer, watch::Receiver<ConnectionState>, JoinHandle<Result<(), HubError>>) {
        let (mut peer, state, task) = start(hub, username, ConnectionConfig::default());
        expect(&mut peer, NotificationType::System).await;
        expect(&mut peer, NotificationType::OnlineUsers).await;
        (peer, state, task)
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_closed() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let (mut peer, state, task) = connected(&hub, "alice").await;
        assert_eq!(*state.borrow(), ConnectionState::Active);

        peer.disconnect();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        assert_eq!(hub.stats().await.unwrap().connections, 0);
    }

    #[tokio::test]
    async fn test_ping_is_answered_locally() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let (mut peer, _state, _task) = connected(&hub, "alice").await;

        peer.send_text(r#"{"type":"ping"}"#).await.unwrap();
        let pong = expect(&mut peer, NotificationType::Pong).await;
        assert_eq!(pong.username, "alice");
        assert_eq!(hub.stats().await.unwrap().deliveries, 2);
    }

    #[tokio::test]
    async fn test_bad_input_keeps_connection_active() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let (mut peer, state, _task) = connected(&hub, "alice").await;

        peer.send_text("not json").await.unwrap();
        expect(&mut peer, NotificationType::Error).await;

        peer.send_text(r#"{"type":"dance"}"#).await.unwrap();
        let error = expect(&mut peer, NotificationType::Error).await;
        assert!(error.content.unwrap().contains("dance"));

        peer.send_text(r#"{"type":"chat_message"}"#).await.unwrap();
        expect(&mut peer, NotificationType::Error).await;

        peer.send_text(r#"{"type":"join_room"}"#).await.unwrap();
        expect(&mut peer, NotificationType::Error).await;

        peer.send_text(r#"{"type":"private_message","content":"hi"}"#)
            .await
            .unwrap();
        expect(&mut peer, NotificationType::Error).await;

        peer.send(Frame::Binary(Bytes::from_static(br#"{"type":"ping"}"#)))
            .await
            .unwrap();
        expect(&mut peer, NotificationType::Pong).await;
        assert_eq!(*state.borrow(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let config = ConnectionConfig::default().with_max_frame_size(32);
        let (mut peer, _state, task) = start(&hub, "alice", config);
        expect(&mut peer, NotificationType::System).await;
        expect(&mut peer, NotificationType::OnlineUsers).await;

        let content = "x".repeat(64);
        peer.send_text(format!(r#"{{"type":"chat_message","content":"{content}"}}"#))
            .await
            .unwrap();

        assert_eq!(timeout(WAIT, peer.recv()).await.unwrap(), Some(Frame::Close));
        assert_eq!(timeout(WAIT, peer.recv()).await.unwrap(), None);
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_expires_without_pongs() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let config = ConnectionConfig::default().with_pong_wait(Duration::from_secs(1));
        let (_peer, state, task) = start(&hub, "alice", config);

        timeout(Duration::from_secs(10), task).await.unwrap().unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_connection_alive() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());
        let config = ConnectionConfig::default().with_pong_wait(Duration::from_secs(1));
        let (mut peer, state, task) = start(&hub, "alice", config);

        let mut pings = 0;
        while pings < 4 {
            match peer.recv().await {
                Some(Frame::Ping(_)) => {
                    pings += 1;
                    peer.send(Frame::Pong(Bytes::new())).await.unwrap();
                }
                Some(_) => {}
                None => panic!("connection closed while answering pings"),
            }
        }
        assert_eq!(*state.borrow(), ConnectionState::Active);

        peer.disconnect();
        timeout(Duration::from_secs(10), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registration_refused_during_shutdown() {
        let (hub, task) = Hub::spawn(CancellationToken::new());
        hub.shutdown();
        task.await.unwrap();

        let (mut peer, state, task) = start(&hub, "alice", ConnectionConfig::default());
        let result = timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(result, Err(HubError::ShuttingDown));
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_evicted_stalled_connection_still_closes() {
        let (hub, _task) = Hub::spawn(CancellationToken::new());

        // The peer never reads, so the transport stalls after one frame.
        let (sink, stream, _peer) = memory::pair(1);
        let config = ConnectionConfig::default()
            .with_outbound_capacity(4)
            .with_write_grace(Duration::from_millis(50));
        let connection = Connection::new(Identity::new(1, "stalled"), sink, stream, hub.clone(), config);
        let mut state = connection.state();
        let task = tokio::spawn(connection.run());

        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Active))
            .await
            .unwrap()
            .unwrap();

        for i in 0..32 {
            let chat = Notification::new(NotificationType::ChatMessage, "bob").with_content(format!("msg {i}"));
            hub.dispatch(Dispatch::all(chat)).await.unwrap();
        }

        timeout(WAIT, task)
            .await
            .expect("evicted connection did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
        assert!(hub.online_users().await.unwrap().is_empty());
        assert_eq!(hub.stats().await.unwrap().evictions, 1);
    }

    #[test]
    fn test_config_ping_interval_follows_pong_wait() {
        let config = ConnectionConfig::default().with_pong_wait(Duration::from_secs(10));
        assert_eq!(config.ping_interval, Duration::from_secs(9));
        assert_eq!(ConnectionConfig::default().outbound_capacity, 256);
        assert_eq!(ConnectionConfig::default().write_grace, DEFAULT_WRITE_GRACE);
    }
}
