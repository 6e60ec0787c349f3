//! # murmur-transport
//!
//! Transport abstraction layer for Murmur sessions.
//!
//! - **WebSocket** - axum WebSocket split into read and write halves
//! - **Memory** - an in-process duplex pair, used to drive sessions in tests
//!
//! ```rust,ignore
//! use murmur_transport::{FrameSource, Incoming};
//!
//! async fn read_all(mut source: impl FrameSource) {
//!     while let Ok(Some(Incoming::Frame(frame))) = source.recv().await {
//!         // Dispatch frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{FrameSink, FrameSource, Incoming, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketSink, WebSocketSource};
