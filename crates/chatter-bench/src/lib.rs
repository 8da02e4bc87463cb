//! Shared helpers for Chatter benchmarks.

use chatter_core::{Identity, Registration};
use chatter_transport::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A registration backed by a plain channel, plus the receiving end.
#[must_use]
pub fn registration(user_id: u64, capacity: usize) -> (Registration, mpsc::Receiver<Arc<str>>) {
    let (sender, rx) = mpsc::channel(capacity);
    let registration = Registration {
        id: ConnectionId::generate(),
        identity: Identity::new(user_id, format!("user-{user_id}")),
        sender,
        cancel: CancellationToken::new(),
    };
    (registration, rx)
}

/// Discard everything buffered in a receiver, returning how many frames it held.
pub fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> usize {
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}
