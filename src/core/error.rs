//! Error types for the Cof transport.

use thiserror::Error;

/// Reasons a datagram is rejected by the codec.
///
/// These are never fatal: the endpoint drops the datagram and moves on,
/// since UDP guarantees nothing about what arrives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the fixed header.
    #[error("datagram truncated: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Checksum does not match the received bytes.
    #[error("checksum mismatch: header says {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum recomputed over the received bytes.
        actual: u32,
    },

    /// Wrong magic number or unsupported protocol version.
    #[error("not a cof packet (magic {magic:#06x}, version {version})")]
    NotAProtocolPacket {
        /// Magic number found.
        magic: u16,
        /// Version byte found.
        version: u8,
    },

    /// `payload_length` disagrees with the trailing byte count.
    #[error("payload length mismatch: header says {declared}, but {actual} bytes follow")]
    LengthMismatch {
        /// Length declared in the header.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// Fragment index/count pair is impossible.
    #[error("invalid fragment {index} of {count}")]
    InvalidFragment {
        /// Fragment index.
        index: u16,
        /// Fragment count.
        count: u16,
    },

    /// Unrecognized packet type byte.
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidPacketType(u8),
}

/// Top-level Cof errors.
#[derive(Debug, Error)]
pub enum CofError {
    /// Transport error.
    #[cfg(feature = "transport")]
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
