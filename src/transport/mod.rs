//! Cof Protocol - Transport Layer
//!
//! Reliable, ordered, session-oriented message delivery over UDP:
//!
//! - **Packets**: [`Packet`] and the checksummed wire [`codec`]
//! - **Handshake**: session id allocation and confirmation ([`handshake`])
//! - **Reliability**: ACK tracking and bounded retransmission ([`ReliabilityEngine`])
//! - **Fragmentation**: splitting and reassembly of large messages ([`fragment`])
//! - **Sessions**: per-peer sequence and buffer state ([`Session`])
//! - **Endpoints**: the socket-owning driver shared by client and server ([`Endpoint`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Upper layer (clone/push/pull)       │
//! ├─────────────────────────────────────────┤
//! │   CofClient / CofServer                 │
//! ├─────────────────────────────────────────┤
//! │   Endpoint: driver, session table       │  ← This module
//! │   Session, reliability, fragmentation   │
//! │   Packet codec                          │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

pub mod codec;
mod endpoint;
mod error;
pub mod fragment;
pub mod handshake;
mod packet;
mod reliability;
mod session;
mod socket;

pub use endpoint::{
    CAPACITY_REASON, CLOSE_REASON, Endpoint, EndpointStats, IDLE_REASON, MAX_RETRIES_REASON,
    SessionHandle, StatsSnapshot,
};
pub(crate) use endpoint::EndpointHandle;
pub use error::*;
pub use packet::*;
pub use reliability::{DeliveryFailure, PendingAck, PollOutcome, ReliabilityEngine};
pub use session::*;
pub use socket::CofSocket;
