//! In-memory transport.
//!
//! A channel-backed connection used by tests and benchmarks. [`pair`] returns
//! the server-side halves plus a [`MemoryPeer`] that plays the client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{Frame, FrameSink, FrameStream, TransportError};

/// Create a connected in-memory transport.
///
/// `capacity` bounds each direction independently.
#[must_use]
pub fn pair(capacity: usize) -> (MemorySink, MemoryStream, MemoryPeer) {
    let (to_server, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_server) = mpsc::channel(capacity);

    (
        MemorySink { tx: Some(to_peer) },
        MemoryStream { rx: from_peer },
        MemoryPeer {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

/// Server-side write half.
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

/// Server-side read half.
pub struct MemoryStream {
    rx: mpsc::Receiver<Frame>,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.take();
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

impl MemoryPeer {
    /// Send a frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server dropped its read half or the peer
    /// already disconnected.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a text frame to the server.
    ///
    /// # Errors
    ///
    /// See [`MemoryPeer::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the server has released its write half.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Drop the client's write half, ending the server's read stream.
    pub fn disconnect(&mut self) {
        self.tx.take();
    }
}
