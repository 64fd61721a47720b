use crate::config::ReplicationConfig;
use crate::protocol::Message;
use crate::registry::BoardEntry;
use crate::replication::ReplicationEngine;
use crate::transport::{Connection, Inbound, PeerLink, TransportError};
use crate::types::BoardId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outbound half of the directory service
#[async_trait]
pub trait DirectoryLink: Send + Sync {
    /// Tell the directory this peer shares `id`
    async fn announce_share(&self, id: &BoardId) -> Result<(), TransportError>;

    /// Tell the directory this peer stopped sharing `id`
    async fn announce_unshare(&self, id: &BoardId) -> Result<(), TransportError>;

    /// Hang up on the directory
    fn close(&self);
}

/// Directory link over the TCP substrate
pub struct TcpDirectoryLink {
    link: PeerLink,
}

impl TcpDirectoryLink {
    pub async fn connect(
        addr: &str,
        config: &ReplicationConfig,
    ) -> Result<(Self, Inbound), TransportError> {
        let (link, inbound) =
            Connection::connect(addr, config.connect_timeout(), config.max_frame_bytes).await?;
        info!(directory = %addr, conn = %link.id(), "connected to directory");
        Ok((Self { link }, inbound))
    }
}

#[async_trait]
impl DirectoryLink for TcpDirectoryLink {
    async fn announce_share(&self, id: &BoardId) -> Result<(), TransportError> {
        self.link.send(Message::ShareBoard(id.clone()))
    }

    async fn announce_unshare(&self, id: &BoardId) -> Result<(), TransportError> {
        self.link.send(Message::UnshareBoard(id.clone()))
    }

    fn close(&self) {
        self.link.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    Share(BoardId),
    Unshare(BoardId),
}

/// In-memory directory link for testing
#[derive(Clone, Default)]
pub struct InMemoryDirectoryLink {
    announcements: Arc<RwLock<Vec<Announcement>>>,
    unreachable: Arc<AtomicBool>,
}

impl InMemoryDirectoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything announced so far, in order
    pub async fn announcements(&self) -> Vec<Announcement> {
        self.announcements.read().await.clone()
    }

    /// While unreachable every announcement fails with `Closed`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    async fn record(&self, announcement: Announcement) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.announcements.write().await.push(announcement);
        Ok(())
    }
}

#[async_trait]
impl DirectoryLink for InMemoryDirectoryLink {
    async fn announce_share(&self, id: &BoardId) -> Result<(), TransportError> {
        self.record(Announcement::Share(id.clone())).await
    }

    async fn announce_unshare(&self, id: &BoardId) -> Result<(), TransportError> {
        self.record(Announcement::Unshare(id.clone())).await
    }

    fn close(&self) {}
}

/// Keeps the directory in step with local sharing, and remote announcements
/// in step with the registry
pub struct DiscoveryClient {
    engine: Arc<ReplicationEngine>,
    directory: Arc<dyn DirectoryLink>,
    announced: Mutex<BTreeSet<BoardId>>,
}

impl DiscoveryClient {
    pub fn new(engine: Arc<ReplicationEngine>, directory: Arc<dyn DirectoryLink>) -> Self {
        Self {
            engine,
            directory,
            announced: Mutex::new(BTreeSet::new()),
        }
    }

    /// Announce `id` as shared; repeated calls send nothing
    pub async fn announce_share(&self, id: &BoardId) -> Result<bool, TransportError> {
        let mut announced = self.announced.lock().await;
        if announced.contains(id) {
            debug!(board = %id, "already announced");
            return Ok(false);
        }
        self.directory.announce_share(id).await?;
        announced.insert(id.clone());
        info!(board = %id, "announced share");
        Ok(true)
    }

    /// Retract the share of `id`; nothing is sent if it was never announced
    pub async fn announce_unshare(&self, id: &BoardId) -> Result<bool, TransportError> {
        let mut announced = self.announced.lock().await;
        if !announced.contains(id) {
            debug!(board = %id, "not announced, nothing to retract");
            return Ok(false);
        }
        // Stays announced until the directory has been told
        self.directory.announce_unshare(id).await?;
        announced.remove(id);
        info!(board = %id, "announced unshare");
        Ok(true)
    }

    /// Whether the directory currently advertises `id` for this peer
    pub async fn is_announced(&self, id: &BoardId) -> bool {
        self.announced.lock().await.contains(id)
    }

    pub fn close(&self) {
        self.directory.close();
    }

    /// Follow directory announcements until the directory hangs up
    pub async fn run(self: Arc<Self>, mut inbound: Inbound) {
        while let Some(next) = inbound.next().await {
            match next {
                Ok(msg) => self.handle(msg).await,
                Err(e) => warn!("undecodable directory message: {}", e),
            }
        }
        warn!("directory connection closed; no further announcements");
    }

    /// React to one message from the directory
    pub async fn handle(&self, msg: Message) {
        match msg {
            Message::SharingBoard(id) => self.on_board_shared(id).await,
            Message::UnsharingBoard(id) => self.on_board_unshared(id).await,
            Message::Error(text) => warn!("directory reported: {}", text),
            other => warn!(event = %other.event(), "unexpected message from directory"),
        }
    }

    async fn on_board_shared(&self, id: BoardId) {
        let registry = self.engine.registry();
        if !registry.insert_new(BoardEntry::remote(id.clone()), false).await {
            debug!(board = %id, "already known, announcement ignored");
            return;
        }
        info!(board = %id, owner = %id.owner_addr(), "remote board discovered");

        // Dialling may take up to the connect timeout
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move { engine.subscribe(id).await });
    }

    async fn on_board_unshared(&self, id: BoardId) {
        let registry = self.engine.registry();
        match registry.get(&id).await {
            Some(info) if info.is_remote => {
                self.engine.unsubscribe(&id).await;
                registry.remove(&id).await;
                info!(board = %id, "remote board withdrawn by its owner");
            }
            Some(_) => warn!(board = %id, "directory reported a board owned here as unshared; ignored"),
            None => debug!(board = %id, "unshare of an unknown board ignored"),
        }
    }
}
