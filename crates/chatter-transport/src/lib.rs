//! # chatter-transport
//!
//! Transport abstraction layer for the Chatter delivery hub.
//!
//! A physical connection is split into two halves so that reads and writes
//! can be owned by different tasks:
//!
//! - [`FrameStream`] - the read half, owned by a connection's inbound loop
//! - [`FrameSink`] - the write half, owned by a connection's outbound loop
//!
//! Implementations:
//!
//! - **WebSocket** - axum's upgraded socket (feature `websocket`, on by default)
//! - **Memory** - channel-backed pair for tests and benchmarks
//!
//! ```rust,ignore
//! use chatter_transport::{Frame, FrameStream};
//!
//! async fn drain(mut stream: impl FrameStream) {
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, Frame, FrameSink, FrameStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketSink, WebSocketStream};
