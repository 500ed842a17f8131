//! # Cof Transport
//!
//! Reliable, session-oriented message delivery over UDP for the Cof
//! version-control system. Remote operations (clone, push, pull) move large
//! binary blocks between a client and a self-hosted server through this
//! crate:
//!
//! - **Integrity**: every datagram carries a checksum; corrupt ones are dropped
//! - **Sessions**: a three-way handshake agrees on a random session id
//! - **Reliability**: per-packet ACKs with bounded retransmission
//! - **Fragmentation**: messages larger than the payload limit are split and
//!   reassembled transparently
//!
//! ## Feature Flags
//!
//! - `transport` (default): packets, codec, sessions, reliability, sockets
//! - `client` (default): [`client::CofClient`] and `cof://` URLs
//! - `server` (default): [`server::CofServer`] and its session stream
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration and error types (always included)
//! - [`transport`]: protocol machinery (requires `transport` feature)
//! - [`client`]: client endpoint (requires `client` feature)
//! - [`server`]: server endpoint (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use cof_transport::prelude::*;
//!
//! # async fn run() -> Result<(), CofError> {
//! let mut server = CofServer::new(TransportConfig::default());
//! let mut incoming = server.listen("127.0.0.1:7357".parse().unwrap()).await?;
//!
//! let config = TransportConfig::default();
//! let client = CofClient::bind("127.0.0.1:0".parse().unwrap(), config).await?;
//! let session = client.connect_url(&"cof://127.0.0.1/my_repo".parse()?).await?;
//! client.send(&session, b"list refs").await?;
//!
//! if let Some(remote) = incoming.accept().await {
//!     let request = server.receive(&remote).await?;
//!     server.send(&remote, &request).await?;
//! }
//! assert_eq!(client.receive(&session).await?, b"list refs");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{CofError, DecodeError, TransportConfig, TransportConfigBuilder};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        SessionHandle, SessionId, SessionState, StatsSnapshot, TransportError, TransportResult,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{CofClient, RemoteUrl};

    #[cfg(feature = "server")]
    pub use crate::server::{CofServer, Incoming};
}

// Re-export commonly used items at crate root
pub use core::{CofError, DecodeError, TransportConfig};

#[cfg(feature = "transport")]
pub use transport::{Packet, PacketType, SessionHandle, SessionId, SessionState, TransportError};
