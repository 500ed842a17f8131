//! Protocol constants for the Cof transport.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Timing and size defaults are only the starting point for
//! [`TransportConfig`](super::TransportConfig).

use std::time::Duration;

// =============================================================================
// WIRE IDENTITY
// =============================================================================

/// Magic number at the start of every datagram.
pub const PROTOCOL_MAGIC: u16 = 0xC0F1;

/// Protocol version (v1).
pub const PROTOCOL_VERSION: u8 = 0x01;

// =============================================================================
// PACKET TYPES
// =============================================================================

/// Client asks the server to allocate a session.
pub const PACKET_TYPE_HANDSHAKE_REQUEST: u8 = 0x01;

/// Server answers with the allocated session id.
pub const PACKET_TYPE_HANDSHAKE_RESPONSE: u8 = 0x02;

/// Upper-layer data (possibly one fragment of a larger message).
pub const PACKET_TYPE_DATA: u8 = 0x03;

/// Acknowledges one DATA sequence.
pub const PACKET_TYPE_ACK: u8 = 0x04;

/// Peer-reported failure or session termination.
pub const PACKET_TYPE_ERROR: u8 = 0x05;

// =============================================================================
// PACKET SIZES
// =============================================================================

/// Bytes covered by the checksum before the payload
/// (magic + version + type + session + sequence + fragment fields + length).
pub const CHECKSUMMED_HEADER_SIZE: usize = 2 + 1 + 1 + 4 + 4 + 2 + 2 + 2;

/// Checksum width.
pub const CHECKSUM_SIZE: usize = 4;

/// Fixed header length; the minimum valid datagram.
pub const HEADER_SIZE: usize = CHECKSUMMED_HEADER_SIZE + CHECKSUM_SIZE;

/// Hard upper bound on a single packet's payload (width of `payload_length`).
pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;

/// Default fragmentation threshold, chosen to stay under a typical MTU.
pub const DEFAULT_MAX_PAYLOAD: usize = 1200;

/// Largest datagram the endpoint will ever read.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Reserved session id meaning "not yet assigned".
pub const UNASSIGNED_SESSION_ID: u32 = 0;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Default retransmission timeout.
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of retransmissions of one DATA packet before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default number of handshake requests per connect.
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Default bound on a single `receive` call.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Close a session after this long without inbound packets.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the reliability tick.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default server session table limit.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Upper bound on every configured timeout and interval (one day).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// RECEIVE BUFFERS
// =============================================================================

/// Default span of inbound sequences accepted ahead of the first gap.
pub const DEFAULT_RECEIVE_WINDOW: u32 = 8192;

/// Default number of partially reassembled messages per session.
pub const DEFAULT_MAX_PARTIAL_MESSAGES: usize = 128;

/// Default bytes a session holds for the application (partial, waiting
/// and undelivered messages together).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024 * 1024;

// =============================================================================
// ADDRESSING
// =============================================================================

/// Port used when a `cof://` URL omits one.
pub const DEFAULT_PORT: u16 = 7357;

/// URL scheme for remote repositories.
pub const URL_SCHEME: &str = "cof";
