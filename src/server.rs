use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::tls::TlsAcceptor;

/// A bound stream listener plus the TLS capability accepted connections
/// should be wrapped with. The TLS handshake runs in the per-connection
/// task, not in the accept loop.
pub struct StreamListener {
    listener: TcpListener,
    tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
}

impl StreamListener {
    pub fn new(listener: TcpListener, tls_acceptor: Option<Arc<dyn TlsAcceptor>>) -> Self {
        Self {
            listener,
            tls_acceptor,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    pub fn tls_acceptor(&self) -> Option<Arc<dyn TlsAcceptor>> {
        self.tls_acceptor.clone()
    }
}

/// The uniform lifecycle contract each service implements for the host.
///
/// The host calls `listen`/`listen_packet` to bind, then `serve`/
/// `serve_packet` (which block until the service is stopped or the
/// listener fails), and finally `stop`. `stop` is idempotent; it ends the
/// accept and dispatch loops but lets in-flight relays and sessions drain
/// to their own I/O termination.
#[async_trait]
pub trait NetServer: Send + Sync {
    /// Binds the configured stream address. Does not accept.
    async fn listen(&self) -> std::io::Result<StreamListener>;

    /// Binds the configured datagram address. Does not read.
    async fn listen_packet(&self) -> std::io::Result<UdpSocket>;

    /// Accepts stream connections until `stop` or a listener failure.
    async fn serve(&self, listener: StreamListener) -> std::io::Result<()>;

    /// Runs the datagram dispatch loop until `stop` or an endpoint failure.
    async fn serve_packet(&self, socket: UdpSocket) -> std::io::Result<()>;

    fn stop(&self) -> std::io::Result<()>;

    /// Informational hook, invoked once after all listeners are up.
    fn on_startup_complete(&self);
}

pub(crate) async fn bind_stream_listener(address: &NetLocation) -> std::io::Result<TcpListener> {
    TcpListener::bind((address.address().to_string(), address.port()))
        .await
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to bind tcp {address}: {e}"))
        })
}

pub(crate) async fn bind_packet_socket(address: &NetLocation) -> std::io::Result<UdpSocket> {
    UdpSocket::bind((address.address().to_string(), address.port()))
        .await
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to bind udp {address}: {e}"))
        })
}

pub(crate) async fn wrap_stream(
    stream: TcpStream,
    tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
) -> std::io::Result<Box<dyn AsyncStream>> {
    match tls_acceptor {
        Some(acceptor) => acceptor.accept(stream).await,
        None => Ok(Box::new(stream)),
    }
}
