//! In-memory transport.
//!
//! [`pair`] returns the server-side halves a session runs on plus a
//! [`MemoryClient`] that plays the remote peer. Client frames go through
//! the same JSON codec a WebSocket text frame would.

use async_trait::async_trait;
use murmur_protocol::{codec, ClientFrame, Encoded, Encoding, ServerFrame};
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, Incoming, TransportError};

/// Something the client pushes towards the server.
#[derive(Debug)]
enum ClientEvent {
    Text(String),
    Pong,
    Fail(String),
}

/// Something the server pushed towards the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A decoded frame.
    Frame(ServerFrame),
    /// A heartbeat ping.
    Ping,
    /// The server closed the connection.
    Close,
}

/// Create a connected in-memory duplex.
///
/// `buffer` bounds the server→client direction; a client that stops
/// calling [`MemoryClient::recv`] eventually stalls the sink.
#[must_use]
pub fn pair(buffer: usize) -> (MemorySource, MemorySink, MemoryClient) {
    let (client_tx, client_rx) = mpsc::channel(64);
    let (server_tx, server_rx) = mpsc::channel(buffer.max(1));

    (
        MemorySource { rx: client_rx },
        MemorySink {
            tx: server_tx,
            open: true,
        },
        MemoryClient {
            tx: Some(client_tx),
            rx: server_rx,
        },
    )
}

/// The server's read half.
pub struct MemorySource {
    rx: mpsc::Receiver<ClientEvent>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.rx.recv().await {
            Some(ClientEvent::Text(text)) => Ok(Some(match codec::decode_client_text(&text) {
                Ok(frame) => Incoming::Frame(frame),
                Err(e) => Incoming::Invalid(e),
            })),
            Some(ClientEvent::Pong) => Ok(Some(Incoming::Heartbeat)),
            Some(ClientEvent::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// The server's write half.
pub struct MemorySink {
    tx: mpsc::Sender<ServerEvent>,
    open: bool,
}

impl MemorySink {
    async fn push(&mut self, event: ServerEvent) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        // Round-trip through the codec so tests see exactly what a client would
        let frame = match Encoding::Json.encode_server(frame)? {
            Encoded::Text(text) => codec::decode_server_text(&text)?,
            Encoded::Binary(_) => frame.clone(),
        };
        self.push(ServerEvent::Frame(frame)).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.push(ServerEvent::Ping).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        let result = self.push(ServerEvent::Close).await;
        self.open = false;
        result
    }
}

/// The remote peer of an in-memory connection.
pub struct MemoryClient {
    tx: Option<mpsc::Sender<ClientEvent>>,
    rx: mpsc::Receiver<ServerEvent>,
}

impl MemoryClient {
    async fn push(&self, event: ClientEvent) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Send a client frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        match Encoding::Json.encode_client(frame)? {
            Encoded::Text(text) => self.send_text(text).await,
            Encoded::Binary(_) => Err(TransportError::SendFailed("unexpected binary".into())),
        }
    }

    /// Send raw text, well-formed or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.push(ClientEvent::Text(text.into())).await
    }

    /// Answer a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub async fn pong(&self) -> Result<(), TransportError> {
        self.push(ClientEvent::Pong).await
    }

    /// Make the server's next read fail with a transport error.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.push(ClientEvent::Fail(reason.into())).await
    }

    /// Hang up cleanly; the server reads end-of-stream.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Receive the next server event.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    /// Receive the next frame, skipping pings.
    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        loop {
            match self.rx.recv().await? {
                ServerEvent::Frame(frame) => return Some(frame),
                ServerEvent::Ping => continue,
                ServerEvent::Close => return None,
            }
        }
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_frames_reach_source() {
        let (mut source, _sink, client) = pair(8);

        client.send(&ClientFrame::join(7)).await.unwrap();
        client.send_text("garbage").await.unwrap();
        client.pong().await.unwrap();

        assert!(matches!(
            source.recv().await.unwrap(),
            Some(Incoming::Frame(ClientFrame::JoinRoom { room_id: 7 }))
        ));
        assert!(matches!(
            source.recv().await.unwrap(),
            Some(Incoming::Invalid(_))
        ));
        assert!(matches!(
            source.recv().await.unwrap(),
            Some(Incoming::Heartbeat)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let (mut source, _sink, mut client) = pair(8);
        client.disconnect();
        assert!(source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sink_to_client() {
        let (_source, mut sink, mut client) = pair(8);

        sink.ping().await.unwrap();
        sink.send(&ServerFrame::room_joined(3)).await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(client.recv().await, Some(ServerEvent::Ping));
        assert!(matches!(
            client.next_frame().await,
            Some(ServerFrame::RoomJoined { room_id: 3, .. })
        ));
        assert_eq!(client.recv().await, Some(ServerEvent::Close));
        assert!(sink.send(&ServerFrame::room_left(3)).await.is_err());
    }
}
