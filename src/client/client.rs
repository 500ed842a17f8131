//! High-level Cof client API.
//!
//! `CofClient` owns one UDP socket and the sessions it created with
//! `connect`. Every operation on a client that was never opened fails with
//! [`TransportError::SocketNotInitialized`].

use std::net::SocketAddr;

use tracing::info;

use super::remote::RemoteUrl;
use crate::core::{CofError, TransportConfig};
use crate::transport::{
    Endpoint, EndpointHandle, SessionHandle, SessionState, StatsSnapshot, TransportError,
    TransportResult,
};

/// A Cof client endpoint.
///
/// # Example
///
/// ```ignore
/// use cof_transport::prelude::*;
///
/// let mut client = CofClient::new(TransportConfig::default());
/// client.open("0.0.0.0:0".parse()?).await?;
///
/// let session = client.connect("127.0.0.1:7357".parse()?).await?;
/// client.send(&session, b"want refs/heads/main").await?;
/// let reply = client.receive(&session).await?;
/// client.close(&session).await?;
/// ```
pub struct CofClient {
    config: TransportConfig,
    inner: Option<EndpointHandle>,
}

impl CofClient {
    /// Create a client; no socket is bound until [`open`](Self::open).
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            inner: None,
        }
    }

    /// Create and open a client in one step.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> TransportResult<Self> {
        let mut client = Self::new(config);
        client.open(addr).await?;
        Ok(client)
    }

    /// Bind the client socket and start its driver.
    pub async fn open(&mut self, addr: SocketAddr) -> TransportResult<()> {
        if self.inner.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let handle = Endpoint::client(addr, self.config.clone()).await?;
        info!(local_addr = %handle.endpoint().local_addr(), "client opened");
        self.inner = Some(handle);
        Ok(())
    }

    /// Check if the socket is bound.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Client configuration.
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

    /// Perform the handshake with a server.
    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<SessionHandle> {
        self.endpoint()?.connect(addr).await
    }

    /// Resolve a `cof://` URL and connect to it.
    pub async fn connect_url(&self, url: &RemoteUrl) -> Result<SessionHandle, CofError> {
        let endpoint = self.endpoint()?;
        let addr = url.resolve().await?;
        Ok(endpoint.connect(addr).await?)
    }

    /// Send one message, waiting until every fragment is acknowledged.
    pub async fn send(&self, session: &SessionHandle, message: &[u8]) -> TransportResult<()> {
        self.endpoint()?.send(session, message).await
    }

    /// Wait for the next complete message on a session.
    pub async fn receive(&self, session: &SessionHandle) -> TransportResult<Vec<u8>> {
        self.endpoint()?.receive(session).await
    }

    /// Close a session, notifying the server.
    pub async fn close(&self, session: &SessionHandle) -> TransportResult<()> {
        self.endpoint()?.close(session).await
    }

    /// Current state of a session.
    pub async fn session_state(&self, session: &SessionHandle) -> TransportResult<SessionState> {
        Ok(self.endpoint()?.session_state(session).await)
    }

    /// Close every session and release the socket.
    pub async fn shutdown(self) {
        if let Some(handle) = self.inner {
            handle.shutdown().await;
        }
    }

    fn endpoint(&self) -> TransportResult<&Endpoint> {
        self.inner
            .as_ref()
            .map(EndpointHandle::endpoint)
            .ok_or(TransportError::SocketNotInitialized)
    }
}

impl Default for CofClient {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl std::fmt::Debug for CofClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CofClient")
            .field("local_addr", &self.inner.as_ref().map(|h| h.endpoint().local_addr()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionId;

    fn handle() -> SessionHandle {
        SessionHandle::detached(SessionId::new(1), "127.0.0.1:7357".parse().unwrap())
    }

    #[tokio::test]
    async fn test_unopened_client() {
        let client = CofClient::default();
        assert!(!client.is_open());

        assert!(matches!(
            client.connect("127.0.0.1:7357".parse().unwrap()).await,
            Err(TransportError::SocketNotInitialized)
        ));
        assert!(matches!(
            client.send(&handle(), b"x").await,
            Err(TransportError::SocketNotInitialized)
        ));
        assert!(matches!(
            client.receive(&handle()).await,
            Err(TransportError::SocketNotInitialized)
        ));
        assert!(matches!(
            client.close(&handle()).await,
            Err(TransportError::SocketNotInitialized)
        ));
        assert!(matches!(
            client.local_addr(),
            Err(TransportError::SocketNotInitialized)
        ));

        let url = RemoteUrl::parse("cof://127.0.0.1/repo").unwrap();
        assert!(matches!(
            client.connect_url(&url).await,
            Err(CofError::Transport(TransportError::SocketNotInitialized))
        ));
    }

    #[tokio::test]
    async fn test_open_twice() {
        let mut client = CofClient::default();
        client.open("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(client.is_open());
        assert_ne!(client.local_addr().unwrap().port(), 0);

        assert!(matches!(
            client.open("127.0.0.1:0".parse().unwrap()).await,
            Err(TransportError::AlreadyOpen)
        ));
        client.shutdown().await;
    }
}
