//! Echo client.
//!
//! Sends each stdin line as one message and checks the reply matches.

use std::net::SocketAddr;

use cof_transport::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

use crate::EchoError;

/// Connect to `url` and echo stdin line by line.
pub async fn run(
    bind: SocketAddr,
    url: &RemoteUrl,
    config: TransportConfig,
) -> Result<(), EchoError> {
    let client = CofClient::bind(bind, config).await?;
    let session = client.connect_url(url).await?;
    info!(session = %session.id(), remote = %url, "connected");

    let result = echo_lines(&client, &session, tokio::io::stdin()).await;
    client.close(&session).await?;
    client.shutdown().await;

    let count = result?;
    info!(count, "all echoes matched");
    Ok(())
}

/// Echo every line of `input`, returning how many round trips matched.
pub async fn echo_lines<R>(
    client: &CofClient,
    session: &SessionHandle,
    input: R,
) -> Result<usize, EchoError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        client.send(session, line.as_bytes()).await?;
        let reply = client.receive(session).await?;
        if reply != line.as_bytes() {
            return Err(EchoError::Mismatch {
                sent: line.len(),
                received: reply.len(),
            });
        }
        count += 1;
    }
    Ok(count)
}
