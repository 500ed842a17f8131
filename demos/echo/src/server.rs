//! Echo server.
//!
//! Every message received on a session is sent back on the same session.
//! Each session runs in its own task until the client closes it.

use std::net::SocketAddr;
use std::sync::Arc;

use cof_transport::prelude::*;
use tracing::{debug, info, warn};

use crate::EchoError;

/// Listen on `addr` and echo until the process is stopped.
pub async fn run(addr: SocketAddr, config: TransportConfig) -> Result<(), EchoError> {
    let mut server = CofServer::new(config);
    let incoming = server.listen(addr).await?;
    info!(addr = %server.local_addr()?, "echo server ready");

    serve(Arc::new(server), incoming).await;
    Ok(())
}

/// Accept sessions until the listener shuts down.
pub async fn serve(server: Arc<CofServer>, mut incoming: Incoming) {
    while let Some(session) = incoming.accept().await {
        info!(session = %session.id(), peer = %session.peer(), "client connected");
        tokio::spawn(echo_session(Arc::clone(&server), session));
    }
}

async fn echo_session(server: Arc<CofServer>, session: SessionHandle) {
    loop {
        let message = match server.receive(&session).await {
            Ok(message) => message,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::SessionClosed) => break,
            Err(err) => {
                warn!(session = %session.id(), %err, "receive failed");
                break;
            }
        };
        debug!(session = %session.id(), len = message.len(), "echo");
        if let Err(err) = server.send(&session, &message).await {
            warn!(session = %session.id(), %err, "echo send failed");
            break;
        }
    }
    info!(session = %session.id(), "client gone");
}
