use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::resolver::{resolve_single_address, Resolver};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Pairs one accepted client stream with a freshly dialed destination
/// stream and copies bytes in both directions until either side fails or
/// reaches EOF, then closes both.
///
/// A dial failure closes the client stream and is returned to the caller;
/// mid-stream failures (including clean EOF) are treated as a close signal
/// rather than an error.
pub async fn relay(
    mut client_stream: Box<dyn AsyncStream>,
    destination: &NetLocation,
    resolver: &Arc<dyn Resolver>,
) -> std::io::Result<()> {
    let remote_stream = match dial_destination(destination, resolver).await {
        Ok(s) => s,
        Err(e) => {
            let _ = client_stream.shutdown().await;
            return Err(e);
        }
    };

    let (client_read, client_write) = tokio::io::split(client_stream);
    let (remote_read, remote_write) = tokio::io::split(remote_stream);

    // One-shot close signal: the first direction to fail cancels it, the
    // second cancel is a no-op.
    let closed = CancellationToken::new();

    let client_to_remote = tokio::spawn(copy_direction(
        client_read,
        remote_write,
        closed.clone(),
    ));
    let remote_to_client = tokio::spawn(copy_direction(
        remote_read,
        client_write,
        closed.clone(),
    ));

    closed.cancelled().await;

    // Both tasks unwind on the close signal and shut their writers down,
    // so after this both connections are closed.
    let (client_result, remote_result) = futures::join!(client_to_remote, remote_to_client);
    debug!(
        "relay to {} finished: client-to-remote {:?}, remote-to-client {:?}",
        destination,
        client_result.unwrap_or(Ok(())),
        remote_result.unwrap_or(Ok(()))
    );

    Ok(())
}

async fn dial_destination(
    destination: &NetLocation,
    resolver: &Arc<dyn Resolver>,
) -> std::io::Result<TcpStream> {
    let remote_addr = resolve_single_address(resolver, destination).await?;
    TcpStream::connect(remote_addr).await.map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("failed to connect to {destination}: {e}"),
        )
    })
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    closed: CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let result = tokio::select! {
        r = copy_until_eof(&mut reader, &mut writer) => r,
        _ = closed.cancelled() => Ok(()),
    };
    closed.cancel();
    // Close unconditionally; closing an already-closed stream is fine.
    let _ = writer.shutdown().await;
    result
}

async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // write_all loops until the whole chunk is flushed; a single write
        // is not guaranteed to consume the buffer on a congested socket.
        writer.write_all(&buf[0..n]).await?;
    }
}
