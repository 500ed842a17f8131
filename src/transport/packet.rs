//! Packet model for the Cof transport.
//!
//! A [`Packet`] is the atomic wire unit. It is immutable once built: the
//! only way to "change" a field is to construct a new packet, which is
//! what keeps the checksum honest (it is computed at encode time from the
//! fields, never stored independently of them).

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::core::{
    MAX_WIRE_PAYLOAD, PACKET_TYPE_ACK, PACKET_TYPE_DATA, PACKET_TYPE_ERROR,
    PACKET_TYPE_HANDSHAKE_REQUEST, PACKET_TYPE_HANDSHAKE_RESPONSE, UNASSIGNED_SESSION_ID,
};

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client asks for a session.
    HandshakeRequest = PACKET_TYPE_HANDSHAKE_REQUEST,
    /// Server assigns a session id.
    HandshakeResponse = PACKET_TYPE_HANDSHAKE_RESPONSE,
    /// Upper-layer bytes.
    Data = PACKET_TYPE_DATA,
    /// Acknowledgment of one DATA sequence.
    Ack = PACKET_TYPE_ACK,
    /// Failure or termination notice.
    Error = PACKET_TYPE_ERROR,
}

impl PacketType {
    /// Parse packet type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_TYPE_HANDSHAKE_REQUEST => Some(Self::HandshakeRequest),
            PACKET_TYPE_HANDSHAKE_RESPONSE => Some(Self::HandshakeResponse),
            PACKET_TYPE_DATA => Some(Self::Data),
            PACKET_TYPE_ACK => Some(Self::Ack),
            PACKET_TYPE_ERROR => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert packet type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Handshake packets are the only ones valid with session id 0.
    pub fn is_handshake(self) -> bool {
        matches!(self, Self::HandshakeRequest | Self::HandshakeResponse)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HandshakeRequest => "HANDSHAKE_REQUEST",
            Self::HandshakeResponse => "HANDSHAKE_RESPONSE",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Session identifier. Zero is reserved for "unassigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    /// The reserved handshake-time id.
    pub const UNASSIGNED: Self = Self(UNASSIGNED_SESSION_ID);

    /// Wrap a raw id.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub fn get(self) -> u32 {
        self.0
    }

    /// True for the reserved id 0.
    pub fn is_unassigned(self) -> bool {
        self.0 == UNASSIGNED_SESSION_ID
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Position of a packet within its logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentInfo {
    /// Zero-based index of this fragment.
    pub index: u16,
    /// Total fragments in the message; 1 means the packet is whole.
    pub count: u16,
}

impl FragmentInfo {
    /// A whole, unfragmented message.
    pub const WHOLE: Self = Self { index: 0, count: 1 };

    /// True when the message needs no reassembly.
    pub fn is_whole(self) -> bool {
        self.count == 1
    }

    /// True when `index < count` and `count >= 1`.
    pub fn is_valid(self) -> bool {
        self.count >= 1 && self.index < self.count
    }
}

/// Errors building a packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Payload does not fit the 16-bit length field.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Largest allowed payload.
        max: usize,
    },

    /// Fragment index/count pair is impossible.
    #[error("invalid fragment {index} of {count}")]
    InvalidFragment {
        /// Fragment index.
        index: u16,
        /// Fragment count.
        count: u16,
    },
}

/// One datagram's worth of protocol data.
///
/// Wire format (little-endian, 22-byte header):
/// ```text
/// +-------+-----+------+------------+----------+-------+-------+---------+----------+---------+
/// | Magic | Ver | Type | Session ID | Sequence | FragI | FragN | Pay Len | Checksum | Payload |
/// | 2     | 1   | 1    | 4          | 4        | 2     | 2     | 2       | 4        | Pay Len |
/// +-------+-----+------+------------+----------+-------+-------+---------+----------+---------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    session_id: SessionId,
    sequence: u32,
    fragment: FragmentInfo,
    payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, validating payload size and fragment fields.
    pub fn new(
        packet_type: PacketType,
        session_id: SessionId,
        sequence: u32,
        fragment: FragmentInfo,
        payload: Vec<u8>,
    ) -> Result<Self, PacketError> {
        if payload.len() > MAX_WIRE_PAYLOAD {
            return Err(PacketError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_WIRE_PAYLOAD,
            });
        }
        if !fragment.is_valid() {
            return Err(PacketError::InvalidFragment {
                index: fragment.index,
                count: fragment.count,
            });
        }
        Ok(Self {
            packet_type,
            session_id,
            sequence,
            fragment,
            payload,
        })
    }

    /// Handshake request carrying the client's nonce.
    pub fn handshake_request(nonce: u32) -> Self {
        Self::control(PacketType::HandshakeRequest, SessionId::UNASSIGNED, nonce)
    }

    /// Handshake response assigning `session_id`, echoing the client's nonce.
    pub fn handshake_response(session_id: SessionId, nonce: u32) -> Self {
        Self::control(PacketType::HandshakeResponse, session_id, nonce)
    }

    /// Acknowledgment of `sequence` within `session_id`.
    pub fn ack(session_id: SessionId, sequence: u32) -> Self {
        Self::control(PacketType::Ack, session_id, sequence)
    }

    /// Error notice with a human-readable reason.
    pub fn error(session_id: SessionId, sequence: u32, reason: &str) -> Self {
        let mut reason = reason.as_bytes().to_vec();
        reason.truncate(MAX_WIRE_PAYLOAD);
        Self {
            packet_type: PacketType::Error,
            session_id,
            sequence,
            fragment: FragmentInfo::WHOLE,
            payload: reason,
        }
    }

    /// Data packet (whole or one fragment).
    pub fn data(
        session_id: SessionId,
        sequence: u32,
        fragment: FragmentInfo,
        payload: Vec<u8>,
    ) -> Result<Self, PacketError> {
        Self::new(PacketType::Data, session_id, sequence, fragment, payload)
    }

    fn control(packet_type: PacketType, session_id: SessionId, sequence: u32) -> Self {
        Self {
            packet_type,
            session_id,
            sequence,
            fragment: FragmentInfo::WHOLE,
            payload: Vec::new(),
        }
    }

    /// Packet type.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Sequence number (handshake nonce for handshake packets).
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Fragment position.
    pub fn fragment(&self) -> FragmentInfo {
        self.fragment
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Logical message id: sequence of the message's first fragment.
    pub fn message_id(&self) -> u32 {
        self.sequence.wrapping_sub(u32::from(self.fragment.index))
    }

    /// Typed view of the packet, one variant per packet type.
    pub fn body(&self) -> PacketBody<'_> {
        match self.packet_type {
            PacketType::HandshakeRequest => PacketBody::HandshakeRequest {
                nonce: self.sequence,
            },
            PacketType::HandshakeResponse => PacketBody::HandshakeResponse {
                session_id: self.session_id,
                nonce: self.sequence,
            },
            PacketType::Data => PacketBody::Data {
                sequence: self.sequence,
                fragment: self.fragment,
                payload: &self.payload,
            },
            PacketType::Ack => PacketBody::Ack {
                sequence: self.sequence,
            },
            PacketType::Error => PacketBody::Error {
                sequence: self.sequence,
                reason: String::from_utf8_lossy(&self.payload),
            },
        }
    }
}

/// Per-type view of a [`Packet`], so dispatch is checked exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody<'a> {
    /// Handshake request.
    HandshakeRequest {
        /// Client nonce identifying the connect attempt.
        nonce: u32,
    },
    /// Handshake response.
    HandshakeResponse {
        /// Assigned id.
        session_id: SessionId,
        /// Echoed client nonce.
        nonce: u32,
    },
    /// Data.
    Data {
        /// Sequence number.
        sequence: u32,
        /// Fragment position.
        fragment: FragmentInfo,
        /// Payload bytes.
        payload: &'a [u8],
    },
    /// Acknowledgment.
    Ack {
        /// Acknowledged sequence.
        sequence: u32,
    },
    /// Error notice.
    Error {
        /// Sequence or nonce the error refers to.
        sequence: u32,
        /// Reason text.
        reason: Cow<'a, str>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for t in [
            PacketType::HandshakeRequest,
            PacketType::HandshakeResponse,
            PacketType::Data,
            PacketType::Ack,
            PacketType::Error,
        ] {
            assert_eq!(PacketType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0xFF), None);
    }

    #[test]
    fn test_session_id() {
        assert!(SessionId::UNASSIGNED.is_unassigned());
        assert!(!SessionId::new(7).is_unassigned());
        assert_eq!(SessionId::new(0xdead).to_string(), "0000dead");
    }

    #[test]
    fn test_payload_too_large() {
        let result = Packet::data(
            SessionId::new(1),
            1,
            FragmentInfo::WHOLE,
            vec![0u8; MAX_WIRE_PAYLOAD + 1],
        );
        assert!(matches!(result, Err(PacketError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_invalid_fragment() {
        let bad = FragmentInfo { index: 3, count: 3 };
        assert!(matches!(
            Packet::data(SessionId::new(1), 1, bad, vec![]),
            Err(PacketError::InvalidFragment { index: 3, count: 3 })
        ));
        let zero = FragmentInfo { index: 0, count: 0 };
        assert!(Packet::data(SessionId::new(1), 1, zero, vec![]).is_err());
    }

    #[test]
    fn test_message_id() {
        let packet = Packet::data(
            SessionId::new(1),
            42,
            FragmentInfo { index: 2, count: 5 },
            vec![1],
        )
        .unwrap();
        assert_eq!(packet.message_id(), 40);
    }

    #[test]
    fn test_body_views() {
        assert_eq!(
            Packet::handshake_request(99).body(),
            PacketBody::HandshakeRequest { nonce: 99 }
        );
        assert_eq!(
            Packet::ack(SessionId::new(5), 12).body(),
            PacketBody::Ack { sequence: 12 }
        );
        match Packet::error(SessionId::new(5), 0, "repository not found").body() {
            PacketBody::Error { reason, .. } => assert_eq!(reason, "repository not found"),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
