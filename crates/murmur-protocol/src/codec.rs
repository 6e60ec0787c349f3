//! Codec for encoding and decoding Murmur envelopes.
//!
//! Text frames carry JSON. Binary frames carry MessagePack with a
//! length prefix, the same framing the bus payloads use.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{ClientFrame, Envelope, RoomId, ServerFrame};

/// Maximum binary frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors: malformed input and rejected requests.
///
/// Every variant is reported to the client as a single `error` frame; none
/// of them closes the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame type requires a room id.
    #[error("Frame type '{0}' requires a room_id")]
    MissingRoom(String),

    /// Payload has the wrong shape.
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// Frame type is not recognized.
    #[error("Unknown frame type: {0}")]
    UnknownType(String),

    /// Join refused by the membership authority.
    #[error("Not permitted to join room {0}")]
    JoinDenied(RoomId),

    /// Publish to a room the session has not joined.
    #[error("Not a member of room {0}")]
    NotRoomMember(RoomId),
}

impl ProtocolError {
    /// The room this error concerns, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            ProtocolError::JoinDenied(room) | ProtocolError::NotRoomMember(room) => Some(*room),
            _ => None,
        }
    }
}

/// Encode an envelope to a length-prefixed MessagePack buffer.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed MessagePack envelope.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let envelope = rmp_serde::from_slice(&payload)?;

    Ok(Some(envelope))
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a JSON text envelope.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope.
pub fn decode_json(text: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Wire encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// An encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Encoding {
    /// Encode a server frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_server(&self, frame: &ServerFrame) -> Result<Encoded, ProtocolError> {
        self.encode(&Envelope::from(frame))
    }

    /// Encode a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_client(&self, frame: &ClientFrame) -> Result<Encoded, ProtocolError> {
        self.encode(&Envelope::from(frame))
    }

    fn encode(&self, envelope: &Envelope) -> Result<Encoded, ProtocolError> {
        match self {
            Encoding::Json => encode_json(envelope).map(Encoded::Text),
            Encoding::MessagePack => encode(envelope).map(Encoded::Binary),
        }
    }
}

/// Decode a client frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is malformed or the envelope is invalid.
pub fn decode_client_text(text: &str) -> Result<ClientFrame, ProtocolError> {
    ClientFrame::try_from(decode_json(text)?)
}

/// Decode a client frame from a binary MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is malformed or the envelope is invalid.
pub fn decode_client_binary(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
    ClientFrame::try_from(decode(data)?)
}

/// Decode a server frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is malformed or the type is not a server type.
pub fn decode_server_text(text: &str) -> Result<ServerFrame, ProtocolError> {
    ServerFrame::try_from(decode_json(text)?)
}
