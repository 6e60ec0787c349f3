//! Error taxonomy for the hub.

use murmur_protocol::ProtocolError;
use murmur_transport::TransportError;
use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::hub::HubError;
use crate::session::ConnectionId;

/// An external store call failed.
///
/// Surfaced to the caller; the core never retries store calls itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the call.
    #[error("{store} store unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },

    /// A stored value could not be decoded.
    #[error("{store} store returned corrupt data: {reason}")]
    Corrupt { store: &'static str, reason: String },
}

impl StoreError {
    /// Persistence store failure.
    pub fn persistence(reason: impl std::fmt::Display) -> Self {
        StoreError::Unavailable {
            store: "persistence",
            reason: reason.to_string(),
        }
    }

    /// Presence store failure.
    pub fn presence(reason: impl std::fmt::Display) -> Self {
        StoreError::Unavailable {
            store: "presence",
            reason: reason.to_string(),
        }
    }
}

/// Top-level error for session and dispatch paths.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Read or write failure on a session. Ends the session.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unauthorized inbound frame. Answered with an error frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Outbound buffer overflow. The session was evicted.
    #[error("Outbound buffer full, connection {0} evicted")]
    Capacity(ConnectionId),

    /// A bus handler failed; the bus redelivers.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// A Presence or Persistence store call failed.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// The hub actor refused the request.
    #[error(transparent)]
    Hub(#[from] HubError),
}
