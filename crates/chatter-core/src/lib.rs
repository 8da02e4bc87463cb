//! # chatter-core
//!
//! Hub, presence, room routing and connection actors for the Chatter
//! real-time delivery hub.
//!
//! This crate provides the moving parts behind a chat endpoint:
//!
//! - **Hub** - single-writer command loop owning all shared state
//! - **Registry** - live connections, username map and room map
//! - **Presence** - the online-users view, computed on demand
//! - **Room** - named member sets, pruned when empty
//! - **Connection** - per-client actor with inbound and outbound loops
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands   ┌─────────────┐     ┌─────────────┐
//! │  Connection │────────────▶│     Hub     │────▶│  Registry   │
//! │  (reader)   │             └─────────────┘     └─────────────┘
//! └─────────────┘                    │              │         │
//!        ▲                           │ try_send     ▼         ▼
//!        │ close               ┌─────────────┐  ┌────────┐ ┌───────┐
//! ┌─────────────┐   drain      │  outbound   │  │Presence│ │ Rooms │
//! │  Connection │◀─────────────│   queue     │  └────────┘ └───────┘
//! │  (writer)   │              └─────────────┘
//! └─────────────┘
//! ```
//!
//! Nothing outside the hub loop touches the registry, so every command
//! observes the state left by the previous one.

pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod presence;
pub mod registry;
pub mod room;

pub use connection::{Connection, ConnectionConfig, ConnectionState, Identity};
pub use dispatch::{Dispatch, Target};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats, Registration};
pub use presence::Presence;
pub use registry::Registry;
pub use room::{Room, RoomId};
