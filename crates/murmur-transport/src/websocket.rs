//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`] and splits it into a
//! [`WebSocketSource`] and a [`WebSocketSink`]. Upgrade negotiation itself
//! happens in the HTTP layer.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{codec, ClientFrame, Encoded, Encoding, ProtocolError, ServerFrame};
use tracing::{debug, warn};

use crate::traits::{FrameSink, FrameSource, Incoming, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Encoding used for outbound frames.
    pub encoding: Encoding,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024,
            encoding: Encoding::Json,
        }
    }
}

/// Split an upgraded socket into its read and write halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    remote_addr: Option<String>,
    config: &WebSocketConfig,
) -> (WebSocketSource, WebSocketSink) {
    let (sink, stream) = socket.split();
    let source = WebSocketSource {
        stream,
        remote_addr,
        read_buffer: BytesMut::with_capacity(1024),
        max_message_size: config.max_message_size,
    };
    let sink = WebSocketSink {
        sink,
        encoding: config.encoding,
        open: true,
    };
    (source, sink)
}

/// The read half of a WebSocket connection.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    remote_addr: Option<String>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketSource {
    fn decode_binary(&mut self, data: &[u8]) -> Option<Incoming> {
        self.read_buffer.extend_from_slice(data);

        match codec::decode_from(&mut self.read_buffer) {
            Ok(Some(envelope)) => Some(match ClientFrame::try_from(envelope) {
                Ok(frame) => Incoming::Frame(frame),
                Err(e) => Incoming::Invalid(e),
            }),
            Ok(None) => None,
            Err(e) => {
                self.read_buffer.clear();
                Some(Incoming::Invalid(e))
            }
        }
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            text.len(),
                            self.max_message_size
                        );
                        return Ok(Some(Incoming::Invalid(ProtocolError::FrameTooLarge(
                            text.len(),
                        ))));
                    }

                    return Ok(Some(match codec::decode_client_text(&text) {
                        Ok(frame) => Incoming::Frame(frame),
                        Err(e) => Incoming::Invalid(e),
                    }));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        self.read_buffer.clear();
                        return Ok(Some(Incoming::Invalid(ProtocolError::FrameTooLarge(
                            data.len(),
                        ))));
                    }

                    if let Some(incoming) = self.decode_binary(&data) {
                        return Ok(Some(incoming));
                    }
                    // Partial frame, keep reading
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pings are answered by the WebSocket layer itself
                    return Ok(Some(Incoming::Heartbeat));
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

/// The write half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    encoding: Encoding,
    open: bool,
}

impl WebSocketSink {
    async fn send_message(&mut self, message: Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let message = match self.encoding.encode_server(frame)? {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.send_message(message).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(()); // Already closed
        }

        let result = self.send_message(Message::Close(None)).await;
        self.open = false;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close after close frame failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 4 * 1024);
        assert_eq!(config.encoding, Encoding::Json);
    }
}
