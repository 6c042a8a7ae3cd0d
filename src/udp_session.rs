use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{channel, Sender};
use tokio::task::JoinHandle;

const FORWARD_BUFFER_SIZE: usize = 32 * 1024;
const CLOSE_CHANNEL_CAPACITY: usize = 64;

/// One datagram client's association: a dedicated remote socket plus the
/// task forwarding remote replies back through the shared local socket.
///
/// `connect` only opens the remote socket; the forwarding task is started
/// by [`SessionTable::insert`] once the table entry exists, so a failure
/// report can never race ahead of the insert.
pub struct UdpSession {
    remote_socket: Arc<UdpSocket>,
    join_handle: Option<JoinHandle<()>>,
}

impl UdpSession {
    /// Opens a dedicated remote socket for one client.
    pub async fn connect(remote_addr: SocketAddr) -> std::io::Result<Self> {
        let bind_addr = if remote_addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let remote_socket = UdpSocket::bind(bind_addr).await?;
        remote_socket.connect(remote_addr).await?;

        Ok(Self {
            remote_socket: Arc::new(remote_socket),
            join_handle: None,
        })
    }

    pub fn remote_socket(&self) -> Arc<UdpSocket> {
        self.remote_socket.clone()
    }

    fn start(
        &mut self,
        client_addr: SocketAddr,
        local_socket: Arc<UdpSocket>,
        closed_tx: Sender<SocketAddr>,
    ) {
        self.join_handle = Some(tokio::spawn(forward_from_remote(
            self.remote_socket.clone(),
            local_socket,
            client_addr,
            closed_tx,
        )));
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Reads replies from the session's remote socket and writes them back to
/// the client through the shared local socket. Any failure reports the
/// client address on the close-notification channel and ends the task.
async fn forward_from_remote(
    remote_socket: Arc<UdpSocket>,
    local_socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    closed_tx: Sender<SocketAddr>,
) {
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];
    loop {
        let n = match remote_socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("udp session for {client_addr}: remote read failed: {e}");
                break;
            }
        };
        if let Err(e) = local_socket.send_to(&buf[0..n], client_addr).await {
            warn!("udp session for {client_addr}: reply to client failed: {e}");
            break;
        }
    }
    let _ = closed_tx.send(client_addr).await;
}

/// Client-address-keyed table of active sessions.
///
/// Inserts come from the dispatch loop, removals only from the cleanup
/// loop; both go through the same lock. Dropping the table drops every
/// session, which aborts their forwarding tasks.
pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>>,
    closed_tx: Sender<SocketAddr>,
    cleanup_handle: JoinHandle<()>,
}

impl SessionTable {
    pub fn new() -> Self {
        let (closed_tx, mut closed_rx) = channel::<SocketAddr>(CLOSE_CHANNEL_CAPACITY);
        let sessions: Arc<Mutex<HashMap<SocketAddr, UdpSession>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Cleanup loop: the only path that removes entries. A session is
        // removed at most once; repeated notifications for the same
        // address are no-ops.
        let cleanup_handle = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                while let Some(client_addr) = closed_rx.recv().await {
                    if sessions.lock().remove(&client_addr).is_some() {
                        debug!("removed udp session for {client_addr}");
                    }
                }
            })
        };

        Self {
            sessions,
            closed_tx,
            cleanup_handle,
        }
    }

    /// Channel on which forwarding tasks report failed sessions.
    pub fn closed_tx(&self) -> Sender<SocketAddr> {
        self.closed_tx.clone()
    }

    /// Returns the existing session's remote socket, if any. The socket is
    /// cloned out so the caller does not hold the table lock across await
    /// points.
    pub fn remote_socket(&self, client_addr: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.sessions
            .lock()
            .get(client_addr)
            .map(|session| session.remote_socket())
    }

    /// Inserts the session and starts its forwarding task. The task is
    /// spawned while the table lock is held, so the cleanup loop cannot
    /// process a failure report for this session before its entry exists.
    pub fn insert(
        &self,
        client_addr: SocketAddr,
        local_socket: Arc<UdpSocket>,
        mut session: UdpSession,
    ) {
        let mut sessions = self.sessions.lock();
        session.start(client_addr, local_socket, self.closed_tx.clone());
        sessions.insert(client_addr, session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        self.cleanup_handle.abort();
    }
}
