use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::admission::AdmissionLimiter;
use crate::async_stream::AsyncStream;
use crate::server::{
    bind_packet_socket, bind_stream_listener, wrap_stream, NetServer, StreamListener,
};
use crate::tls::TlsAcceptor;

const MAX_ECHO_PACKET_SIZE: usize = 4096;

/// Echoes received bytes back to the sender, over streams and datagrams.
pub struct EchoServer {
    address: NetLocation,
    tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    limiter: AdmissionLimiter,
    shutdown: CancellationToken,
}

impl EchoServer {
    pub fn new(
        address: NetLocation,
        tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
        udp_concurrency: usize,
    ) -> Self {
        Self {
            address,
            tls_acceptor,
            limiter: AdmissionLimiter::new(udp_concurrency),
            shutdown: CancellationToken::new(),
        }
    }
}

async fn echo_stream(stream: Box<dyn AsyncStream>) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let result = tokio::io::copy(&mut read_half, &mut write_half).await;
    let _ = write_half.shutdown().await;
    result.map(|_| ())
}

#[async_trait]
impl NetServer for EchoServer {
    async fn listen(&self) -> std::io::Result<StreamListener> {
        let listener = bind_stream_listener(&self.address).await?;
        Ok(StreamListener::new(listener, self.tls_acceptor.clone()))
    }

    async fn listen_packet(&self) -> std::io::Result<UdpSocket> {
        bind_packet_socket(&self.address).await
    }

    async fn serve(&self, listener: StreamListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };

            let tls_acceptor = listener.tls_acceptor();
            tokio::spawn(async move {
                let stream = match wrap_stream(stream, tls_acceptor).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("tls accept from {peer_addr} failed: {e}");
                        return;
                    }
                };
                match echo_stream(stream).await {
                    Ok(()) => debug!("echo connection from {peer_addr} finished"),
                    Err(e) => debug!("echo connection from {peer_addr} failed: {e}"),
                }
            });
        }
    }

    async fn serve_packet(&self, socket: UdpSocket) -> std::io::Result<()> {
        let socket = Arc::new(socket);
        loop {
            // Admission first: when the pool is exhausted this loop stops
            // reading, which is the backpressure point.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                permit = self.limiter.acquire() => permit,
            };

            let mut buf = vec![0u8; MAX_ECHO_PACKET_SIZE];
            let (n, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => received?,
            };

            let socket = socket.clone();
            tokio::spawn(async move {
                // A failed exchange only affects this one datagram.
                if let Err(e) = socket.send_to(&buf[0..n], peer_addr).await {
                    error!("udp echo to {peer_addr} failed: {e}");
                }
                drop(permit);
            });
        }
    }

    fn stop(&self) -> std::io::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    fn on_startup_complete(&self) {
        info!("Echoing on {}", self.address);
    }
}
