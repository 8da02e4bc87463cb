//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`] and splits it into independently
//! owned read and write halves.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::traits::{Frame, FrameSink, FrameStream, TransportError};

/// Split an upgraded socket into its write and read halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WebSocketSink, WebSocketStream) {
    let (sink, stream) = socket.split();
    (WebSocketSink { inner: sink }, WebSocketStream { inner: stream })
}

/// The write half of a WebSocket connection.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

/// The read half of a WebSocket connection.
pub struct WebSocketStream {
    inner: SplitStream<WebSocket>,
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })),
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner
            .send(to_message(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Text(text))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Frame::Binary(Bytes::from(data)))),
            Some(Ok(Message::Ping(data))) => Ok(Some(Frame::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(Frame::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Received close frame");
                Ok(Some(Frame::Close))
            }
            Some(Err(e)) => {
                warn!("WebSocket error: {}", e);
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_to_message() {
        assert_eq!(
            to_message(Frame::Text("hi".into())),
            Message::Text("hi".into())
        );
        assert_eq!(
            to_message(Frame::Ping(Bytes::from_static(b"p"))),
            Message::Ping(b"p".to_vec())
        );
        match to_message(Frame::Close) {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("Expected close message, got {:?}", other),
        }
    }
}
