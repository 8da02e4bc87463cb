//! JSON codec for envelopes and notifications.
//!
//! Each transport frame holds exactly one JSON document, so no length prefix
//! is needed. Encoded notifications are returned as `Arc<str>` so a single
//! encoding can be shared by every recipient of a broadcast.

use std::sync::Arc;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::notification::Notification;

/// Default maximum inbound frame size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Frame payload was not valid UTF-8.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a notification into a shareable JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(notification: &Notification) -> Result<Arc<str>, ProtocolError> {
    let json = serde_json::to_string(notification).map_err(ProtocolError::Encode)?;
    Ok(Arc::from(json))
}

/// Decode an envelope from a text frame.
///
/// # Errors
///
/// Returns an error if the text is not a JSON envelope.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

/// Decode an envelope from a binary frame.
///
/// # Errors
///
/// Returns an error if the payload is not UTF-8 JSON.
pub fn decode_bytes(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
    decode(text)
}

/// Reject frames larger than `max` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] when `size > max`.
pub fn check_frame_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;
    use crate::notification::NotificationType;

    #[test]
    fn test_decode_full_envelope() {
        let envelope =
            decode(r#"{"type":"private_message","content":"hey","recipient_username":"bob"}"#)
                .unwrap();
        assert_eq!(envelope.envelope_type(), Some(EnvelopeType::PrivateMessage));
        assert_eq!(envelope.content(), Some("hey"));
        assert_eq!(envelope.recipient(), Some("bob"));
        assert_eq!(envelope.room_id(), None);
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode(r#"{"content":"x"}"#), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            decode_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_encode_notification() {
        let notification = Notification::new(NotificationType::ChatMessage, "alice")
            .with_content("hi")
            .with_room("general");
        let frame = encode(&notification).unwrap();

        let decoded: Notification = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded, notification);
        assert!(frame.contains(r#""type":"chat_message""#));
    }

    #[test]
    fn test_frame_size_limit() {
        assert!(check_frame_size(DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE).is_ok());
        match check_frame_size(DEFAULT_MAX_FRAME_SIZE + 1, DEFAULT_MAX_FRAME_SIZE) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, DEFAULT_MAX_FRAME_SIZE + 1);
                assert_eq!(max, DEFAULT_MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
