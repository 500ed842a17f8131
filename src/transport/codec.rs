//! Packet encoding and decoding.
//!
//! Decoding never partially trusts a datagram: the length and checksum are
//! verified before any header field is interpreted, and every field is
//! validated before a [`Packet`] is handed to the caller.

use crate::core::{
    CHECKSUMMED_HEADER_SIZE, DecodeError, HEADER_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

use super::packet::{FragmentInfo, Packet, PacketError, PacketType};

/// Checksum over the header bytes that precede the checksum field, then the payload.
///
/// First four bytes of the BLAKE3 digest, little-endian.
pub fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Serialize a packet to its wire form.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let payload = packet.payload();
    let fragment = packet.fragment();

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(packet.packet_type().as_byte());
    buf.extend_from_slice(&packet.session_id().get().to_le_bytes());
    buf.extend_from_slice(&packet.sequence().to_le_bytes());
    buf.extend_from_slice(&fragment.index.to_le_bytes());
    buf.extend_from_slice(&fragment.count.to_le_bytes());
    // Packet construction bounds the payload to u16::MAX.
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());

    let sum = checksum(&buf, payload);
    buf.extend_from_slice(&sum.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a datagram into a packet.
pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            expected: HEADER_SIZE,
            actual: data.len(),
        });
    }

    let header = &data[..CHECKSUMMED_HEADER_SIZE];
    let payload = &data[HEADER_SIZE..];

    let expected = read_u32(data, CHECKSUMMED_HEADER_SIZE);
    let actual = checksum(header, payload);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    let magic = read_u16(data, 0);
    let version = data[2];
    if magic != PROTOCOL_MAGIC || version != PROTOCOL_VERSION {
        return Err(DecodeError::NotAProtocolPacket { magic, version });
    }

    let declared = usize::from(read_u16(data, 16));
    if declared != payload.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    let fragment = FragmentInfo {
        index: read_u16(data, 12),
        count: read_u16(data, 14),
    };
    if !fragment.is_valid() {
        return Err(DecodeError::InvalidFragment {
            index: fragment.index,
            count: fragment.count,
        });
    }

    let packet_type =
        PacketType::from_byte(data[3]).ok_or(DecodeError::InvalidPacketType(data[3]))?;
    let session_id = read_u32(data, 4).into();
    let sequence = read_u32(data, 8);

    Ok(Packet::new(
        packet_type,
        session_id,
        sequence,
        fragment,
        payload.to_vec(),
    )?)
}

impl From<PacketError> for DecodeError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::PayloadTooLarge { size, max } => DecodeError::LengthMismatch {
                declared: max,
                actual: size,
            },
            PacketError::InvalidFragment { index, count } => {
                DecodeError::InvalidFragment { index, count }
            }
        }
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::packet::SessionId;

    /// Recompute the checksum after deliberately editing header fields.
    fn reseal(mut bytes: Vec<u8>) -> Vec<u8> {
        let sum = checksum(&bytes[..CHECKSUMMED_HEADER_SIZE], &bytes[HEADER_SIZE..]);
        bytes[CHECKSUMMED_HEADER_SIZE..HEADER_SIZE].copy_from_slice(&sum.to_le_bytes());
        bytes
    }

    fn sample() -> Packet {
        Packet::data(
            SessionId::new(0x0102_0304),
            0x0a0b_0c0d,
            FragmentInfo { index: 1, count: 3 },
            b"some test data here".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&sample());
        assert_eq!(bytes.len(), HEADER_SIZE + 19);
        // magic | ver | type | session | sequence | frag idx | frag cnt | len
        assert_eq!(
            hex::encode(&bytes[..CHECKSUMMED_HEADER_SIZE]),
            "f1c0".to_owned() + "01" + "03" + "04030201" + "0d0c0b0a" + "0100" + "0300" + "1300"
        );
    }

    #[test]
    fn test_roundtrip() {
        let packets = [
            sample(),
            Packet::handshake_request(0xfeed_beef),
            Packet::handshake_response(SessionId::new(9), 0xfeed_beef),
            Packet::ack(SessionId::new(9), u32::MAX),
            Packet::error(SessionId::new(9), 3, "object not found"),
        ];
        for packet in packets {
            let bytes = encode(&packet);
            assert_eq!(decode(&bytes).unwrap(), packet);
            // Deterministic: re-encoding yields identical bytes
            assert_eq!(encode(&decode(&bytes).unwrap()), bytes);
        }
    }

    #[test]
    fn test_empty_payload() {
        let packet = Packet::data(SessionId::new(1), 1, FragmentInfo::WHOLE, vec![]).unwrap();
        let bytes = encode(&packet);
        assert_eq!(bytes.len(), HEADER_SIZE);

        let decoded = decode(&bytes).unwrap();
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_max_payload() {
        let packet = Packet::data(
            SessionId::new(1),
            1,
            FragmentInfo::WHOLE,
            vec![0x5a; crate::core::MAX_WIRE_PAYLOAD],
        )
        .unwrap();
        assert_eq!(decode(&encode(&packet)).unwrap(), packet);
    }

    #[test]
    fn test_any_flipped_byte_is_checksum_mismatch() {
        let bytes = encode(&sample());
        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            assert!(
                matches!(decode(&corrupted), Err(DecodeError::ChecksumMismatch { .. })),
                "byte {i} flip was not caught"
            );
        }
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            decode(&[]),
            Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                actual: 0
            })
        );
        assert!(matches!(
            decode(b"too short"),
            Err(DecodeError::Truncated { .. })
        ));

        let bytes = encode(&sample());
        assert!(matches!(
            decode(&bytes[..HEADER_SIZE - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_dropped_payload_bytes_fail() {
        let bytes = encode(&sample());
        // Lost tail bytes change what the checksum covers
        assert!(matches!(
            decode(&bytes[..bytes.len() - 2]),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_packet_type() {
        let mut bytes = encode(&Packet::handshake_request(1));
        bytes[3] = 0xFF;
        assert_eq!(
            decode(&reseal(bytes)),
            Err(DecodeError::InvalidPacketType(0xFF))
        );
    }

    #[test]
    fn test_foreign_magic_and_version() {
        let mut bytes = encode(&sample());
        bytes[0] = 0x00;
        assert!(matches!(
            decode(&reseal(bytes)),
            Err(DecodeError::NotAProtocolPacket { .. })
        ));

        let mut bytes = encode(&sample());
        bytes[2] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode(&reseal(bytes)),
            Err(DecodeError::NotAProtocolPacket { version: 2, .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = encode(&sample());
        bytes[16] = 0x05;
        bytes[17] = 0x00;
        assert_eq!(
            decode(&reseal(bytes)),
            Err(DecodeError::LengthMismatch {
                declared: 5,
                actual: 19
            })
        );
    }

    #[test]
    fn test_invalid_fragment_fields() {
        let mut bytes = encode(&sample());
        // index 4 of 3
        bytes[12] = 0x04;
        assert_eq!(
            decode(&reseal(bytes)),
            Err(DecodeError::InvalidFragment { index: 4, count: 3 })
        );
    }
}
