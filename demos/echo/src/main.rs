//! Cof Echo Example
//!
//! Runs an echo server, or a client that sends stdin lines and checks
//! that each comes back unchanged.
//!
//! Environment variables:
//! - COF_MODE: "server" or "client"
//! - COF_BIND_ADDR: Bind address (server default 0.0.0.0:7357, client 0.0.0.0:0)
//! - COF_SERVER_URL: Remote to connect to (client only, default cof://127.0.0.1/echo)
//! - COF_CONFIG: Optional JSON transport config file
//! - COF_LOG_LEVEL: trace|debug|info|warn|error

mod client;
mod server;

use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;

use cof_transport::{CofError, TransportConfig, TransportError};
use thiserror::Error;
use tracing::{Level, error};

/// Errors surfaced by the echo binary.
#[derive(Debug, Error)]
pub enum EchoError {
    /// Library error.
    #[error(transparent)]
    Cof(#[from] CofError),

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reading stdin failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad environment.
    #[error("environment: {0}")]
    Env(String),

    /// The server sent back something else.
    #[error("echo mismatch: sent {sent} bytes, got {received} bytes")]
    Mismatch {
        /// Bytes sent.
        sent: usize,
        /// Bytes received.
        received: usize,
    },
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn bind_addr(default: &str) -> Result<SocketAddr, EchoError> {
    let raw = env_or("COF_BIND_ADDR", default);
    raw.parse()
        .map_err(|_| EchoError::Env(format!("COF_BIND_ADDR is not a socket address: {raw}")))
}

fn load_config() -> Result<TransportConfig, EchoError> {
    match env::var("COF_CONFIG") {
        Ok(path) => Ok(TransportConfig::from_file(path)?),
        Err(_) => Ok(TransportConfig::default()),
    }
}

async fn run() -> Result<(), EchoError> {
    let config = load_config()?;
    match env_or("COF_MODE", "server").as_str() {
        "server" => server::run(bind_addr("0.0.0.0:7357")?, config).await,
        "client" => {
            let url = env_or("COF_SERVER_URL", "cof://127.0.0.1/echo").parse()?;
            client::run(bind_addr("0.0.0.0:0")?, &url, config).await
        }
        other => Err(EchoError::Env(format!(
            "COF_MODE must be \"server\" or \"client\", got {other:?}"
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let level = env_or("COF_LOG_LEVEL", "info")
        .parse()
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "cof-echo failed");
            ExitCode::FAILURE
        }
    }
}
