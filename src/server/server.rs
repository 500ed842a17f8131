//! High-level Cof server API.
//!
//! `CofServer::listen` binds the socket and returns an [`Incoming`] stream
//! that yields each session once its handshake is confirmed. Sessions are
//! then driven through the server's `send`/`receive`/`close`.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::info;

use crate::core::TransportConfig;
use crate::transport::{
    Endpoint, EndpointHandle, SessionHandle, SessionState, StatsSnapshot, TransportError,
    TransportResult,
};

/// Stream of established sessions.
///
/// Ends when the server shuts down.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<SessionHandle>,
}

impl Incoming {
    /// Wait for the next established session.
    ///
    /// Returns `None` once the server has shut down.
    pub async fn accept(&mut self) -> Option<SessionHandle> {
        self.rx.recv().await
    }

    /// Take an already-established session without waiting.
    pub fn try_accept(&mut self) -> Option<SessionHandle> {
        self.rx.try_recv().ok()
    }
}

/// A Cof server endpoint.
///
/// # Example
///
/// ```ignore
/// use cof_transport::prelude::*;
///
/// let mut server = CofServer::new(TransportConfig::default());
/// let mut incoming = server.listen("0.0.0.0:7357".parse()?).await?;
///
/// while let Some(session) = incoming.accept().await {
///     let request = server.receive(&session).await?;
///     server.send(&session, &request).await?;
/// }
/// ```
pub struct CofServer {
    config: TransportConfig,
    inner: Option<EndpointHandle>,
}

impl CofServer {
    /// Create a server; no socket is bound until [`listen`](Self::listen).
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            inner: None,
        }
    }

    /// Bind the server socket and start accepting handshakes.
    pub async fn listen(&mut self, addr: SocketAddr) -> TransportResult<Incoming> {
        if self.inner.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Endpoint::server(addr, self.config.clone(), tx).await?;
        info!(
            local_addr = %handle.endpoint().local_addr(),
            max_sessions = self.config.max_sessions,
            "server listening"
        );
        self.inner = Some(handle);
        Ok(Incoming { rx })
    }

    /// Check if the server is listening.
    pub fn is_listening(&self) -> bool {
        self.inner.is_some()
    }

    /// Server configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Local socket address.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.endpoint()?.local_addr())
    }

    /// Endpoint counters.
    pub fn stats(&self) -> TransportResult<StatsSnapshot> {
        Ok(self.endpoint()?.stats())
    }

    /// Sessions in the table, including half-open ones.
    pub async fn session_count(&self) -> TransportResult<usize> {
        Ok(self.endpoint()?.session_count().await)
    }

    /// Send one message, waiting until every fragment is acknowledged.
    pub async fn send(&self, session: &SessionHandle, message: &[u8]) -> TransportResult<()> {
        self.endpoint()?.send(session, message).await
    }

    /// Wait for the next complete message on a session.
    pub async fn receive(&self, session: &SessionHandle) -> TransportResult<Vec<u8>> {
        self.endpoint()?.receive(session).await
    }

    /// Close a session, notifying the client.
    pub async fn close(&self, session: &SessionHandle) -> TransportResult<()> {
        self.endpoint()?.close(session).await
    }

    /// Current state of a session.
    pub async fn session_state(&self, session: &SessionHandle) -> TransportResult<SessionState> {
        Ok(self.endpoint()?.session_state(session).await)
    }

    /// Close every session and stop the listener.
    pub async fn shutdown(self) {
        if let Some(handle) = self.inner {
            handle.shutdown().await;
            info!("server shut down");
        }
    }

    fn endpoint(&self) -> TransportResult<&Endpoint> {
        self.inner
            .as_ref()
            .map(EndpointHandle::endpoint)
            .ok_or(TransportError::SocketNotInitialized)
    }
}

impl Default for CofServer {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl std::fmt::Debug for CofServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CofServer")
            .field("local_addr", &self.inner.as_ref().map(|h| h.endpoint().local_addr()))
            .finish_non_exhaustive()
    }
}
