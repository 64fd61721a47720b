use crate::protocol::Message;
use crate::transport::{ConnectionId, PeerLink};
use crate::types::BoardId;
use std::collections::BTreeMap;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Subscriber-side lifecycle of one remote board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No snapshot requested yet, or the replica fell behind
    Unbootstrapped,
    /// `GetBoardData` sent, waiting for `BoardData`
    AwaitingSnapshot,
    /// Replica tracks the owner's broadcasts
    Synced,
    /// Owner gone or unsubscribed; the replica is kept read-only
    Closed,
}

/// This peer's single outbound link to a remote board's owner
#[derive(Debug)]
pub struct Upstream {
    state: SubscriptionState,
    link: Option<PeerLink>,
    reader: Option<AbortHandle>,
    listening: bool,
}

impl Upstream {
    pub fn new() -> Self {
        Self {
            state: SubscriptionState::Unbootstrapped,
            link: None,
            reader: None,
            listening: false,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.link.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.state == SubscriptionState::Synced
    }

    /// Attach a freshly dialled connection and its reader task
    pub fn attach(&mut self, link: PeerLink, reader: AbortHandle) {
        self.link = Some(link);
        self.reader = Some(reader);
    }

    /// Ask the owner for a full snapshot
    ///
    /// Used both for the first catch-up and whenever the replica diverged.
    pub fn request_snapshot(&mut self, board: &BoardId) {
        self.state = SubscriptionState::Unbootstrapped;
        let Some(link) = &self.link else {
            return;
        };
        if link.send(Message::GetBoardData(board.clone())).is_ok() {
            self.state = SubscriptionState::AwaitingSnapshot;
            debug!(board = %board, conn = %link.id(), "requested snapshot");
        } else {
            self.mark_closed();
        }
    }

    /// Snapshot applied; start listening if this is the first one
    pub fn mark_synced(&mut self, board: &BoardId) {
        self.state = SubscriptionState::Synced;
        if self.listening {
            return;
        }
        if let Some(link) = &self.link {
            if link.send(Message::Listen(board.clone())).is_ok() {
                self.listening = true;
                debug!(board = %board, conn = %link.id(), "listening");
            } else {
                self.mark_closed();
            }
        }
    }

    /// Terminal: connection gone, keep the replica as is
    pub fn mark_closed(&mut self) {
        self.state = SubscriptionState::Closed;
        self.link = None;
        self.reader = None;
        self.listening = false;
    }

    /// Say goodbye to the owner and stop reading
    pub fn close(&mut self, board: &BoardId) {
        if let Some(link) = self.link.take() {
            let _ = link.send(Message::Unlisten(board.clone()));
            link.close();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = SubscriptionState::Closed;
        self.listening = false;
    }

    pub fn is_on(&self, conn: ConnectionId) -> bool {
        self.link.as_ref().is_some_and(|l| l.id() == conn)
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-side set of peers listening to one board
#[derive(Debug, Default)]
pub struct Listeners {
    links: BTreeMap<ConnectionId, PeerLink>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link: PeerLink) -> bool {
        self.links.insert(link.id(), link).is_none()
    }

    pub fn remove(&mut self, conn: ConnectionId) -> bool {
        self.links.remove(&conn).is_some()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.links.contains_key(&conn)
    }

    /// Send `msg` to every listener, dropping listeners whose link is dead
    pub fn broadcast(&mut self, msg: &Message) -> usize {
        self.links.retain(|conn, link| {
            let alive = link.send(msg.clone()).is_ok();
            if !alive {
                trace!(conn = %conn, "dropping dead listener");
            }
            alive
        });
        self.links.len()
    }

    /// Remove every listener, telling each one the board is gone
    pub fn drain_with(&mut self, farewell: &Message) {
        for (_, link) in std::mem::take(&mut self.links) {
            let _ = link.send(farewell.clone());
        }
    }
}
