use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::relay::relay;
use crate::resolver::{resolve_single_address, NativeResolver, Resolver};
use crate::server::{
    bind_packet_socket, bind_stream_listener, wrap_stream, NetServer, StreamListener,
};
use crate::tls::TlsAcceptor;
use crate::udp_session::{SessionTable, UdpSession};

const MAX_UDP_PACKET_SIZE: usize = 65536;

/// Relays every accepted connection and every datagram client to a fixed
/// destination.
pub struct ProxyServer {
    address: NetLocation,
    destination: NetLocation,
    tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    resolver: Arc<dyn Resolver>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(
        address: NetLocation,
        destination: NetLocation,
        tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    ) -> Self {
        Self {
            address,
            destination,
            tls_acceptor,
            resolver: Arc::new(NativeResolver::new()),
            shutdown: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl NetServer for ProxyServer {
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
            let destination = self.destination.clone();
            let resolver = self.resolver.clone();
            tokio::spawn(async move {
                let stream = match wrap_stream(stream, tls_acceptor).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("tls accept from {peer_addr} failed: {e}");
                        return;
                    }
                };
                // A dial failure is local to this connection; relay already
                // closed the client side.
                match relay(stream, &destination, &resolver).await {
                    Ok(()) => debug!("done proxying {peer_addr} -> {destination}"),
                    Err(e) => warn!("proxying {peer_addr} -> {destination} failed: {e}"),
                }
            });
        }
    }

    async fn serve_packet(&self, socket: UdpSocket) -> std::io::Result<()> {
        let socket = Arc::new(socket);
        let table = SessionTable::new();
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];

        loop {
            let (n, client_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => received?,
            };

            let remote_socket = match table.remote_socket(&client_addr) {
                Some(remote_socket) => remote_socket,
                None => {
                    // Session setup failures only affect this one client.
                    let remote_addr =
                        match resolve_single_address(&self.resolver, &self.destination).await {
                            Ok(addr) => addr,
                            Err(e) => {
                                error!("failed to resolve {} for {client_addr}: {e}", self.destination);
                                continue;
                            }
                        };
                    let session = match UdpSession::connect(remote_addr).await {
                        Ok(session) => session,
                        Err(e) => {
                            error!("failed to open udp session for {client_addr}: {e}");
                            continue;
                        }
                    };
                    debug!("created udp session {client_addr} -> {}", self.destination);
                    let remote_socket = session.remote_socket();
                    table.insert(client_addr, socket.clone(), session);
                    remote_socket
                }
            };

            if let Err(e) = remote_socket.send(&buf[0..n]).await {
                warn!("udp forward for {client_addr} failed: {e}");
                // Route the teardown through the cleanup loop, the only
                // path allowed to remove table entries.
                let _ = table.closed_tx().send(client_addr).await;
            }
        }
    }

    fn stop(&self) -> std::io::Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    fn on_startup_complete(&self) {
        info!("Proxying from {} -> {}", self.address, self.destination);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{sleep, timeout, Duration};

    fn localhost(port: u16) -> NetLocation {
        NetLocation::new(Address::from("127.0.0.1").unwrap(), port)
    }

    #[tokio::test]
    async fn test_stream_proxy_relays_both_directions() {
        // Backend echoes whatever it receives.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match backend.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let server = Arc::new(ProxyServer::new(localhost(0), localhost(backend_port), None));
        let listener = server.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Closing the client side closes the whole relay in bounded time.
        client.shutdown().await.unwrap();
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("relay did not close")
            .unwrap();
        assert_eq!(n, 0);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stream_proxy_destination_down() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let server = Arc::new(ProxyServer::new(localhost(0), localhost(dead_port), None));
        let listener = server.listen().await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await });
        }

        // Dial failure closes the client connection shortly, without a hang.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection not closed after dial failure")
            .unwrap();
        assert_eq!(n, 0);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_packet_proxy_session_affinity() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();

        let server = Arc::new(ProxyServer::new(localhost(0), localhost(backend_port), None));
        let socket = server.listen_packet().await.unwrap();
        let proxy_addr = socket.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve_packet(socket).await });
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"first", proxy_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, first_source) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[0..n], b"first");

        // A second datagram from the same client arrives over the same
        // remote socket, not a new one.
        client.send_to(b"second", proxy_addr).await.unwrap();
        let (n, second_source) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[0..n], b"second");
        assert_eq!(first_source, second_source);

        // Replies reach the client through the shared local socket.
        backend.send_to(b"reply", first_source).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[0..n], b"reply");
        assert_eq!(from, proxy_addr);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_packet_proxy_session_recovery_after_remote_failure() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let server = Arc::new(ProxyServer::new(
            localhost(0),
            localhost(backend_addr.port()),
            None,
        ));
        let socket = server.listen_packet().await.unwrap();
        let proxy_addr = socket.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve_packet(socket).await });
        }

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"one", proxy_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (_, first_source) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // Kill the backend. Forwards to the dead port draw ICMP refusals
        // that fail the session's remote socket, so the session entry is
        // torn down.
        drop(backend);
        for _ in 0..10 {
            client.send_to(b"poke", proxy_addr).await.unwrap();
            sleep(Duration::from_millis(20)).await;
        }

        // Bring the backend back. The next datagram from the same client
        // builds a fresh session, observed as a new remote source.
        let backend = UdpSocket::bind(backend_addr).await.unwrap();
        let mut second_source = first_source;
        for _ in 0..20 {
            client.send_to(b"two", proxy_addr).await.unwrap();
            match timeout(Duration::from_millis(250), backend.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) if &buf[0..n] == b"two" => {
                    second_source = from;
                    break;
                }
                _ => {}
            }
        }
        assert_ne!(first_source, second_source);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_packet_proxy_separate_clients_get_separate_sessions() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend.local_addr().unwrap().port();

        let server = Arc::new(ProxyServer::new(localhost(0), localhost(backend_port), None));
        let socket = server.listen_packet().await.unwrap();
        let proxy_addr = socket.local_addr().unwrap();
        {
            let server = server.clone();
            tokio::spawn(async move { server.serve_packet(socket).await });
        }

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_a.send_to(b"a", proxy_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (_, source_a) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        client_b.send_to(b"b", proxy_addr).await.unwrap();
        let (_, source_b) = timeout(Duration::from_secs(5), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(source_a, source_b);

        // Replies are demultiplexed back to the right client.
        backend.send_to(b"for-b", source_b).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(5), client_b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[0..n], b"for-b");

        server.stop().unwrap();
    }
}
