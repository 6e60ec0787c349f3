//! # murmur-protocol
//!
//! Wire protocol definitions for the Murmur chat hub.
//!
//! Every frame is an envelope `{type, room_id, sender_id, content, time}`.
//! Clients send JSON text frames (or length-prefixed MessagePack binary
//! frames); the hub answers in the same envelope.
//!
//! ## Frame Types
//!
//! - `join_room` / `leave_room` / `message` - sent by clients
//! - `room_joined` / `room_left` / `new_message` / `error` - sent by the hub
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ClientFrame};
//!
//! let frame = codec::decode_client_text(r#"{"type":"join_room","room_id":7}"#).unwrap();
//! assert_eq!(frame, ClientFrame::join(7));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, Encoded, Encoding, ProtocolError};
pub use frames::{kind, ClientFrame, Envelope, MessageId, RoomId, ServerFrame, UserId};
