//! Transparent CONNECT tunnel for hosts outside the intercept domain
//!
//! Bytes are relayed untouched in both directions; nothing is decrypted,
//! parsed or captured here.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::http::{join_host_and_port, respond_with_status, CONNECTION_ESTABLISHED};

/// Bound on dialing the real destination
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `host:port` and relay bytes until either side finishes.
///
/// `leftover` holds bytes the client sent after the CONNECT head; they are
/// delivered to the destination before anything else.
pub async fn handle_plain_connect<C>(
    mut client: C,
    host: &str,
    port: u16,
    leftover: &[u8],
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let addr = join_host_and_port(host, port);
    let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::error!("Failed to establish CONNECT tunnel to {} - {}", addr, e);
            respond_with_status(&mut client, 503, "Service Unavailable", &e.to_string()).await?;
            return Ok(());
        }
        Err(_) => {
            tracing::error!("Timed out establishing CONNECT tunnel to {}", addr);
            respond_with_status(
                &mut client,
                503,
                "Service Unavailable",
                "upstream dial timed out",
            )
            .await?;
            return Ok(());
        }
    };

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;

    tunnel(client, upstream, leftover).await
}

/// Tunnel data between client and upstream.
///
/// Returns as soon as one direction ends; both streams are dropped together on return.
pub async fn tunnel<C, U>(mut client: C, mut upstream: U, leftover: &[u8]) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if !leftover.is_empty() {
        upstream.write_all(leftover).await?;
    }

    let (mut client_reader, mut client_writer) = tokio::io::split(&mut client);
    let (mut upstream_reader, mut upstream_writer) = tokio::io::split(&mut upstream);

    let client_to_upstream = tokio::io::copy(&mut client_reader, &mut upstream_writer);
    let upstream_to_client = tokio::io::copy(&mut upstream_reader, &mut client_writer);

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                tracing::debug!("Client to upstream error: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                tracing::debug!("Upstream to client error: {}", e);
            }
        }
    }

    Ok(())
}
