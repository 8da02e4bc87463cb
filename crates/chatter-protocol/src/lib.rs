//! # chatter-protocol
//!
//! Wire types for the Chatter real-time delivery hub.
//!
//! Clients speak JSON text frames in both directions:
//!
//! - [`Envelope`] - inbound requests (`chat_message`, `join_room`, `leave_room`,
//!   `private_message`, `typing`, `ping`)
//! - [`Notification`] - outbound server-to-client messages
//!
//! ## Example
//!
//! ```rust
//! use chatter_protocol::{codec, EnvelopeType, Notification};
//!
//! let envelope = codec::decode(r#"{"type":"ping"}"#).unwrap();
//! assert_eq!(envelope.envelope_type(), Some(EnvelopeType::Ping));
//!
//! let frame = codec::encode(&Notification::pong("alice")).unwrap();
//! assert!(frame.contains(r#""type":"pong""#));
//! ```

pub mod codec;
pub mod envelope;
pub mod notification;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, EnvelopeType, TypingStatus};
pub use notification::{Notification, NotificationType, UserInfo};
