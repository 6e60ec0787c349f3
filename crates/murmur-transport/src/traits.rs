//! Transport abstraction traits for Murmur.
//!
//! A session owns one [`FrameSource`] (read half) and one [`FrameSink`]
//! (write half) so its inbound and outbound tasks never contend for the
//! same connection.

use async_trait::async_trait;
use murmur_protocol::{ClientFrame, ProtocolError, ServerFrame};
use thiserror::Error;

/// Transport errors.
///
/// Any of these ends the session; they are never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Outbound frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something read from a client.
#[derive(Debug)]
pub enum Incoming {
    /// A well-formed client frame.
    Frame(ClientFrame),
    /// A frame that could not be decoded. The connection stays open.
    Invalid(ProtocolError),
    /// Transport-level keepalive traffic (ping or pong).
    Heartbeat,
}

/// The read half of a client connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next item from the client.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

/// The write half of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the client.
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// Send a transport-level heartbeat ping.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_from_protocol() {
        let err: TransportError = ProtocolError::UnknownType("x".into()).into();
        assert!(matches!(err, TransportError::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: Unknown frame type: x");
    }
}
