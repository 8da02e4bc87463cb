//! # chatter-server
//!
//! HTTP and WebSocket front end for the Chatter delivery hub.
//!
//! The server trusts an upstream proxy for authentication: the user id and
//! username arrive as request headers (or query parameters) and are handed to
//! the hub as an already-established [`chatter_core::Identity`].
//!
//! Routes:
//!
//! - `GET /ws` - WebSocket endpoint (path configurable)
//! - `GET /health` - liveness and open connection count
//! - `GET /api/v1/users/online` - presence snapshot

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{run_server, serve};
