//! Frame types for the Murmur protocol.
//!
//! Every frame travels as an [`Envelope`]: `{type, room_id, sender_id,
//! content, time}`. Inbound envelopes are converted into the closed
//! [`ClientFrame`] union, outbound frames are built as [`ServerFrame`]s and
//! flattened back into envelopes for the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// A room identifier.
pub type RoomId = u64;

/// A user identifier.
pub type UserId = u64;

/// A persisted message identifier.
pub type MessageId = u64;

/// Frame type names as they appear in the `type` field.
pub mod kind {
    pub const JOIN_ROOM: &str = "join_room";
    pub const LEAVE_ROOM: &str = "leave_room";
    pub const MESSAGE: &str = "message";
    pub const ROOM_JOINED: &str = "room_joined";
    pub const ROOM_LEFT: &str = "room_left";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const ERROR: &str = "error";
}

/// The untyped wire envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target or source room (0 when not applicable).
    #[serde(default)]
    pub room_id: RoomId,
    /// Sending user (0 when not applicable).
    #[serde(default)]
    pub sender_id: UserId,
    /// Frame payload.
    #[serde(default)]
    pub content: Value,
    /// Persisted message id, only present on `new_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Server timestamp.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope with only a type and room.
    #[must_use]
    pub fn new(kind: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            kind: kind.into(),
            room_id,
            sender_id: 0,
            content: Value::Null,
            message_id: None,
            time: None,
        }
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = content.into();
        self
    }

    fn require_room(&self) -> Result<RoomId, ProtocolError> {
        if self.room_id == 0 {
            return Err(ProtocolError::MissingRoom(self.kind.clone()));
        }
        Ok(self.room_id)
    }
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Ask to join a room.
    JoinRoom { room_id: RoomId },
    /// Leave a room.
    LeaveRoom { room_id: RoomId },
    /// Publish a text message to a joined room.
    Message { room_id: RoomId, content: String },
    /// Any other `type`. Rejected by the dispatcher.
    Unknown { kind: String },
}

impl ClientFrame {
    /// The wire type name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            ClientFrame::JoinRoom { .. } => kind::JOIN_ROOM,
            ClientFrame::LeaveRoom { .. } => kind::LEAVE_ROOM,
            ClientFrame::Message { .. } => kind::MESSAGE,
            ClientFrame::Unknown { kind } => kind,
        }
    }

    /// The room the frame targets, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ClientFrame::JoinRoom { room_id }
            | ClientFrame::LeaveRoom { room_id }
            | ClientFrame::Message { room_id, .. } => Some(*room_id),
            ClientFrame::Unknown { .. } => None,
        }
    }

    /// Create a join frame.
    #[must_use]
    pub fn join(room_id: RoomId) -> Self {
        ClientFrame::JoinRoom { room_id }
    }

    /// Create a leave frame.
    #[must_use]
    pub fn leave(room_id: RoomId) -> Self {
        ClientFrame::LeaveRoom { room_id }
    }

    /// Create a message frame.
    #[must_use]
    pub fn message(room_id: RoomId, content: impl Into<String>) -> Self {
        ClientFrame::Message {
            room_id,
            content: content.into(),
        }
    }
}

impl TryFrom<Envelope> for ClientFrame {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            kind::JOIN_ROOM => Ok(ClientFrame::JoinRoom {
                room_id: envelope.require_room()?,
            }),
            kind::LEAVE_ROOM => Ok(ClientFrame::LeaveRoom {
                room_id: envelope.require_room()?,
            }),
            kind::MESSAGE => {
                let room_id = envelope.require_room()?;
                match envelope.content {
                    Value::String(content) if !content.is_empty() => {
                        Ok(ClientFrame::Message { room_id, content })
                    }
                    Value::String(_) => Err(ProtocolError::InvalidContent(
                        "message content is empty".to_string(),
                    )),
                    _ => Err(ProtocolError::InvalidContent(
                        "message content must be a string".to_string(),
                    )),
                }
            }
            _ => Ok(ClientFrame::Unknown {
                kind: envelope.kind,
            }),
        }
    }
}

impl From<&ClientFrame> for Envelope {
    fn from(frame: &ClientFrame) -> Self {
        let envelope = Envelope::new(frame.kind(), frame.room_id().unwrap_or_default());
        match frame {
            ClientFrame::Message { content, .. } => envelope.with_content(content.as_str()),
            _ => envelope,
        }
    }
}

/// A frame emitted by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Join confirmed.
    RoomJoined { room_id: RoomId, time: DateTime<Utc> },
    /// Leave confirmed, or membership revoked.
    RoomLeft { room_id: RoomId, time: DateTime<Utc> },
    /// A message broadcast to a room.
    NewMessage {
        message_id: MessageId,
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        time: DateTime<Utc>,
    },
    /// A rejected request.
    Error {
        room_id: Option<RoomId>,
        message: String,
        time: DateTime<Utc>,
    },
}

impl ServerFrame {
    /// Create a `room_joined` frame stamped now.
    #[must_use]
    pub fn room_joined(room_id: RoomId) -> Self {
        ServerFrame::RoomJoined {
            room_id,
            time: Utc::now(),
        }
    }

    /// Create a `room_left` frame stamped now.
    #[must_use]
    pub fn room_left(room_id: RoomId) -> Self {
        ServerFrame::RoomLeft {
            room_id,
            time: Utc::now(),
        }
    }

    /// Create a `new_message` frame stamped now.
    #[must_use]
    pub fn new_message(
        message_id: MessageId,
        room_id: RoomId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        ServerFrame::NewMessage {
            message_id,
            room_id,
            sender_id,
            content: content.into(),
            time: Utc::now(),
        }
    }

    /// Create an `error` frame stamped now.
    #[must_use]
    pub fn error(room_id: Option<RoomId>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            room_id,
            message: message.into(),
            time: Utc::now(),
        }
    }

    /// The wire type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::RoomJoined { .. } => kind::ROOM_JOINED,
            ServerFrame::RoomLeft { .. } => kind::ROOM_LEFT,
            ServerFrame::NewMessage { .. } => kind::NEW_MESSAGE,
            ServerFrame::Error { .. } => kind::ERROR,
        }
    }

    /// The room the frame concerns, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ServerFrame::RoomJoined { room_id, .. }
            | ServerFrame::RoomLeft { room_id, .. }
            | ServerFrame::NewMessage { room_id, .. } => Some(*room_id),
            ServerFrame::Error { room_id, .. } => *room_id,
        }
    }
}

impl From<&ServerFrame> for Envelope {
    fn from(frame: &ServerFrame) -> Self {
        let mut envelope = Envelope::new(frame.kind(), frame.room_id().unwrap_or_default());
        match frame {
            ServerFrame::RoomJoined { time, .. } => {
                envelope.content = Value::from("joined room");
                envelope.time = Some(*time);
            }
            ServerFrame::RoomLeft { time, .. } => {
                envelope.content = Value::from("left room");
                envelope.time = Some(*time);
            }
            ServerFrame::NewMessage {
                message_id,
                sender_id,
                content,
                time,
                ..
            } => {
                envelope.sender_id = *sender_id;
                envelope.message_id = Some(*message_id);
                envelope.content = Value::from(content.as_str());
                envelope.time = Some(*time);
            }
            ServerFrame::Error { message, time, .. } => {
                envelope.content = Value::from(message.as_str());
                envelope.time = Some(*time);
            }
        }
        envelope
    }
}

impl TryFrom<Envelope> for ServerFrame {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, ProtocolError> {
        let time = envelope.time.unwrap_or_else(Utc::now);
        let text = |content: Value| match content {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };

        match envelope.kind.as_str() {
            kind::ROOM_JOINED => Ok(ServerFrame::RoomJoined {
                room_id: envelope.require_room()?,
                time,
            }),
            kind::ROOM_LEFT => Ok(ServerFrame::RoomLeft {
                room_id: envelope.require_room()?,
                time,
            }),
            kind::NEW_MESSAGE => Ok(ServerFrame::NewMessage {
                message_id: envelope.message_id.unwrap_or_default(),
                room_id: envelope.require_room()?,
                sender_id: envelope.sender_id,
                content: text(envelope.content),
                time,
            }),
            kind::ERROR => Ok(ServerFrame::Error {
                room_id: (envelope.room_id != 0).then_some(envelope.room_id),
                message: text(envelope.content),
                time,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}
