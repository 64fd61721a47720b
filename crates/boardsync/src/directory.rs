use crate::protocol::Message;
use crate::transport::{Connection, ConnectionId, Inbound, PeerLink};
use crate::types::BoardId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct DirectoryState {
    /// Shared board -> connection of the peer that shared it
    shared: BTreeMap<BoardId, ConnectionId>,
    peers: BTreeMap<ConnectionId, PeerLink>,
}

impl DirectoryState {
    fn broadcast_except(&mut self, origin: ConnectionId, msg: &Message) {
        self.peers.retain(|conn, link| {
            *conn == origin || link.send(msg.clone()).is_ok()
        });
    }
}

/// Advertises which boards are shared; never sees board content
///
/// Announcements and peer arrivals are serialised by one lock so every peer
/// observes shares and unshares in the same order.
pub struct DirectoryServer {
    state: Mutex<DirectoryState>,
    max_frame_bytes: usize,
}

impl DirectoryServer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            max_frame_bytes,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Directory listening on {}", addr),
            Err(e) => warn!("Directory address unknown: {}", e),
        }

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept directory connection: {}", e);
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);
            self.accept(socket, peer_addr.to_string()).await;
        }
    }

    /// Register a peer connection and replay the current shares to it
    pub async fn accept<S>(self: &Arc<Self>, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, inbound) = Connection::spawn(stream, remote, self.max_frame_bytes);
        self.join(link.clone()).await;
        tokio::spawn(Arc::clone(self).serve(link, inbound));
    }

    async fn join(&self, link: PeerLink) {
        let mut state = self.state.lock().await;
        for id in state.shared.keys() {
            let _ = link.send(Message::SharingBoard(id.clone()));
        }
        info!(conn = %link.id(), remote = %link.remote(), replayed = state.shared.len(), "peer joined");
        state.peers.insert(link.id(), link);
    }

    async fn serve(self: Arc<Self>, link: PeerLink, mut inbound: Inbound) {
        while let Some(next) = inbound.next().await {
            match next {
                Ok(msg) => self.handle(&link, msg).await,
                Err(e) => {
                    warn!(conn = %link.id(), "protocol error: {}", e);
                    let _ = link.send(Message::Error(e.to_string()));
                }
            }
        }
        self.leave(link.id()).await;
        link.close();
    }

    pub async fn handle(&self, link: &PeerLink, msg: Message) {
        match msg {
            Message::ShareBoard(id) => self.share(link, id).await,
            Message::UnshareBoard(id) => self.unshare(link, id).await,
            Message::Error(text) => warn!(conn = %link.id(), "peer reported: {}", text),
            other => {
                warn!(conn = %link.id(), event = %other.event(), "unexpected message");
                let _ = link.send(Message::Error(format!(
                    "unexpected {} on a directory connection",
                    other.event()
                )));
            }
        }
    }

    async fn share(&self, link: &PeerLink, id: BoardId) {
        let mut state = self.state.lock().await;
        if state.shared.contains_key(&id) {
            debug!(board = %id, conn = %link.id(), "already shared");
            return;
        }
        state.shared.insert(id.clone(), link.id());
        state.broadcast_except(link.id(), &Message::SharingBoard(id.clone()));
        info!(board = %id, conn = %link.id(), "board shared");
    }

    async fn unshare(&self, link: &PeerLink, id: BoardId) {
        let mut state = self.state.lock().await;
        match state.shared.get(&id) {
            None => debug!(board = %id, conn = %link.id(), "not shared, unshare ignored"),
            Some(owner) if *owner != link.id() => {
                warn!(board = %id, conn = %link.id(), "unshare from a peer that did not share");
                let _ = link.send(Message::Error(format!("{} was shared by another peer", id)));
            }
            Some(_) => {
                state.shared.remove(&id);
                state.broadcast_except(link.id(), &Message::UnsharingBoard(id.clone()));
                info!(board = %id, conn = %link.id(), "board unshared");
            }
        }
    }

    /// Forget a disconnected peer and withdraw everything it shared
    async fn leave(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        state.peers.remove(&conn);
        let orphaned: Vec<BoardId> = state
            .shared
            .iter()
            .filter(|(_, owner)| **owner == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in orphaned {
            state.shared.remove(&id);
            state.broadcast_except(conn, &Message::UnsharingBoard(id.clone()));
            info!(board = %id, conn = %conn, "board unshared, its peer left");
        }
        info!(conn = %conn, "peer left");
    }

    /// Currently shared boards, sorted
    pub async fn shared_boards(&self) -> Vec<BoardId> {
        self.state.lock().await.shared.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_MAX_FRAME_BYTES;
    use std::time::Duration;
    use tokio::time::timeout;

    fn board(n: u32) -> BoardId {
        BoardId::from_timestamp("127.0.0.1", 4000, n as u128).unwrap()
    }

    /// Connect a fake peer; returns its sending link and inbound stream
    async fn peer(server: &Arc<DirectoryServer>, name: &str) -> (PeerLink, Inbound) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        server.accept(a, name.to_string()).await;
        Connection::spawn(b, "directory".into(), DEFAULT_MAX_FRAME_BYTES)
    }

    async fn recv(inbound: &mut Inbound) -> Message {
        timeout(Duration::from_secs(2), inbound.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed")
            .expect("undecodable message")
    }

    async fn silent(inbound: &mut Inbound) -> bool {
        timeout(Duration::from_millis(100), inbound.next()).await.is_err()
    }

    async fn shared_eventually(server: &DirectoryServer, expected: Vec<BoardId>) {
        for _ in 0..200 {
            if server.shared_boards().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("shared boards never became {:?}", expected);
    }

    #[tokio::test]
    async fn test_share_reaches_other_peers_only() {
        let server = Arc::new(DirectoryServer::new(DEFAULT_MAX_FRAME_BYTES));
        let (alice, mut alice_in) = peer(&server, "alice").await;
        let (_bob, mut bob_in) = peer(&server, "bob").await;

        alice.send(Message::ShareBoard(board(1))).unwrap();
        alice.send(Message::ShareBoard(board(1))).unwrap();
        assert_eq!(recv(&mut bob_in).await, Message::SharingBoard(board(1)));
        assert!(silent(&mut bob_in).await);
        assert!(silent(&mut alice_in).await);

        alice.send(Message::UnshareBoard(board(1))).unwrap();
        assert_eq!(recv(&mut bob_in).await, Message::UnsharingBoard(board(1)));
        shared_eventually(&server, vec![]).await;
    }

    #[tokio::test]
    async fn test_late_joiner_gets_current_shares() {
        let server = Arc::new(DirectoryServer::new(DEFAULT_MAX_FRAME_BYTES));
        let (alice, _alice_in) = peer(&server, "alice").await;
        alice.send(Message::ShareBoard(board(2))).unwrap();
        alice.send(Message::ShareBoard(board(1))).unwrap();
        shared_eventually(&server, vec![board(1), board(2)]).await;

        let (_carol, mut carol_in) = peer(&server, "carol").await;
        assert_eq!(recv(&mut carol_in).await, Message::SharingBoard(board(1)));
        assert_eq!(recv(&mut carol_in).await, Message::SharingBoard(board(2)));
    }

    #[tokio::test]
    async fn test_disconnect_unshares_boards() {
        let server = Arc::new(DirectoryServer::new(DEFAULT_MAX_FRAME_BYTES));
        let (alice, alice_in) = peer(&server, "alice").await;
        let (_bob, mut bob_in) = peer(&server, "bob").await;

        alice.send(Message::ShareBoard(board(1))).unwrap();
        assert_eq!(recv(&mut bob_in).await, Message::SharingBoard(board(1)));

        alice.close();
        drop(alice_in);
        assert_eq!(recv(&mut bob_in).await, Message::UnsharingBoard(board(1)));
        shared_eventually(&server, vec![]).await;
    }

    #[tokio::test]
    async fn test_only_sharer_can_unshare() {
        let server = Arc::new(DirectoryServer::new(DEFAULT_MAX_FRAME_BYTES));
        let (alice, _alice_in) = peer(&server, "alice").await;
        let (bob, mut bob_in) = peer(&server, "bob").await;

        alice.send(Message::ShareBoard(board(1))).unwrap();
        assert_eq!(recv(&mut bob_in).await, Message::SharingBoard(board(1)));

        bob.send(Message::UnshareBoard(board(1))).unwrap();
        assert!(matches!(recv(&mut bob_in).await, Message::Error(_)));
        assert_eq!(server.shared_boards().await, vec![board(1)]);
    }

    #[tokio::test]
    async fn test_unexpected_message_gets_error() {
        let server = Arc::new(DirectoryServer::new(DEFAULT_MAX_FRAME_BYTES));
        let (alice, mut alice_in) = peer(&server, "alice").await;
        alice.send(Message::Listen(board(1))).unwrap();
        assert!(matches!(recv(&mut alice_in).await, Message::Error(_)));
    }
}
