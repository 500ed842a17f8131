//! Transport layer error types.
//!
//! Decode failures and unknown sessions never reach a caller: the endpoint
//! drops the datagram, logs it and bumps a counter. Everything else is
//! surfaced from `connect`, `send`, `receive` or `close`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::packet::{PacketError, PacketType, SessionId};
use crate::core::DecodeError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Datagram failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Packet could not be built.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Operation on an endpoint whose socket was never opened.
    #[error("socket not initialized")]
    SocketNotInitialized,

    /// Endpoint configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Endpoint socket is already open.
    #[error("socket already open")]
    AlreadyOpen,

    /// No handshake response within the attempt budget.
    #[error("handshake with {peer} timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// Target address.
        peer: SocketAddr,
        /// Requests sent.
        attempts: u32,
    },

    /// Protocol violation during the handshake.
    #[error("unexpected {0} packet during handshake")]
    UnexpectedPacketType(PacketType),

    /// Server refused the session.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// A DATA packet went unacknowledged through every retransmission.
    #[error("sequence {sequence} unacknowledged after {retries} retransmissions")]
    MaxRetriesExceeded {
        /// Sequence that was never acknowledged.
        sequence: u32,
        /// Retransmissions performed.
        retries: u32,
    },

    /// Session was closed locally, by the peer, or after a failure.
    #[error("session closed")]
    SessionClosed,

    /// No session with this id on the endpoint.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// `receive` found no message before its deadline.
    #[error("receive timed out")]
    Timeout,

    /// Message needs more fragments than the wire can number.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Message size.
        size: usize,
        /// Largest sendable message at the configured payload size.
        max: usize,
    },

    /// Session sequence space is used up; open a new session.
    #[error("sequence space exhausted - session must be reopened")]
    SequenceExhausted,
}

impl TransportError {
    /// Check if this error is handled by dropping the datagram.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::Decode(_) | TransportError::UnknownSession(_)
        )
    }

    /// Check if this error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::MaxRetriesExceeded { .. }
                | TransportError::SessionClosed
                | TransportError::SequenceExhausted
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
