use crate::config::{Config, ReplicationConfig};
use crate::discovery::{DirectoryLink, DiscoveryClient, TcpDirectoryLink};
use crate::document::{LocalEdit, Snapshot};
use crate::registry::{BoardEntry, BoardInfo, Registry};
use crate::replication::{EditOutcome, ReplicationEngine, SubscriptionState, Upstream};
use crate::transport::TransportError;
use crate::types::{BoardId, ParseError, Path};
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("no board selected")]
    NoSelection,

    #[error("unknown board {0}")]
    UnknownBoard(BoardId),

    #[error("board {0} is not synced with its owner")]
    NotSynced(BoardId),

    #[error("board {0} is owned by another peer")]
    RemoteBoard(BoardId),

    #[error("board {0} is still subscribed")]
    StillSubscribed(BoardId),

    #[error("invalid board id: {0}")]
    InvalidBoardId(#[from] ParseError),

    #[error("failed to bind peer listener: {0}")]
    Bind(io::Error),

    #[error("directory unreachable: {0}")]
    Directory(#[from] TransportError),
}

/// One user's session: the UI-facing API over registry, replication and
/// discovery
pub struct Peer {
    registry: Arc<Registry>,
    engine: Arc<ReplicationEngine>,
    discovery: Arc<DiscoveryClient>,
    host: String,
    port: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Session without background tasks; boards are created as
    /// `host:port:board<millis>`
    pub fn new(
        host: String,
        port: u16,
        directory: Arc<dyn DirectoryLink>,
        config: ReplicationConfig,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let engine = Arc::new(ReplicationEngine::new(Arc::clone(&registry), config));
        let discovery = Arc::new(DiscoveryClient::new(Arc::clone(&engine), directory));
        Self {
            registry,
            engine,
            discovery,
            host,
            port,
            tasks: Vec::new(),
        }
    }

    /// Bind the peer listener, join the directory and start serving
    pub async fn start(config: Config) -> Result<Self, PeerError> {
        let listener = TcpListener::bind(&config.peer.listen_addr)
            .await
            .map_err(PeerError::Bind)?;
        let port = listener.local_addr().map_err(PeerError::Bind)?.port();

        let (directory, announcements) =
            TcpDirectoryLink::connect(&config.directory.addr, &config.replication).await?;

        let mut peer = Self::new(
            config.peer.advertise_host.clone(),
            port,
            Arc::new(directory),
            config.replication.clone(),
        );
        peer.tasks
            .push(tokio::spawn(Arc::clone(&peer.engine).run(listener)));
        peer.tasks
            .push(tokio::spawn(Arc::clone(&peer.discovery).run(announcements)));

        info!(host = %peer.host, port, directory = %config.directory.addr, "peer started");
        Ok(peer)
    }

    /// Address other peers dial for boards owned here
    pub fn advertised_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn list_board_names(&self) -> Vec<BoardId> {
        self.registry.list_names().await
    }

    pub async fn selected(&self) -> Option<BoardId> {
        self.registry.selected().await
    }

    /// Select `id`; unknown boards leave the selection unchanged
    pub async fn select(&self, id: &BoardId) -> bool {
        self.registry.select(id).await
    }

    pub async fn board_info(&self, id: &BoardId) -> Option<BoardInfo> {
        self.registry.get(id).await
    }

    /// Receiver for the selected board's renderable content
    pub fn watch_selected(&self) -> watch::Receiver<Option<Snapshot>> {
        self.registry.watch_selected()
    }

    /// Create an empty, unshared board and select it
    pub async fn create_local_board(&self) -> Result<BoardId, PeerError> {
        let mut millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        loop {
            let id = BoardId::from_timestamp(&self.host, self.port, millis)?;
            if self.registry.insert_new(BoardEntry::local(id.clone()), true).await {
                info!(board = %id, "board created");
                return Ok(id);
            }
            millis += 1;
        }
    }

    /// Share or unshare the selected board
    pub async fn set_shared(&self, shared: bool) -> Result<(), PeerError> {
        let id = self.selected().await.ok_or(PeerError::NoSelection)?;
        self.set_board_shared(&id, shared).await
    }

    pub async fn set_board_shared(&self, id: &BoardId, shared: bool) -> Result<(), PeerError> {
        let changed = self
            .registry
            .with_board(id, |entry| {
                if entry.is_remote {
                    return Err(PeerError::RemoteBoard(id.clone()));
                }
                let changed = entry.is_shared != shared;
                entry.is_shared = shared;
                Ok(changed)
            })
            .await
            .ok_or_else(|| PeerError::UnknownBoard(id.clone()))?
            .inspect_err(|e| warn!(board = %id, "cannot change sharing: {}", e))?;

        // A failed announcement earlier leaves the directory behind the flag
        if !changed && self.discovery.is_announced(id).await == shared {
            debug!(board = %id, shared, "sharing unchanged");
            return Ok(());
        }
        if shared {
            if let Err(e) = self.discovery.announce_share(id).await {
                self.registry
                    .with_board(id, |entry| entry.is_shared = false)
                    .await;
                warn!(board = %id, "share announcement failed: {}", e);
                return Err(e.into());
            }
        } else {
            let announced = self.discovery.announce_unshare(id).await;
            self.engine.stop_sharing(id).await;
            announced?;
        }
        Ok(())
    }

    /// Delete a board
    ///
    /// A shared local board is retracted from the directory and its
    /// listeners are told before the entry goes. A remote board only loses
    /// its subscription.
    pub async fn delete_board(&self, id: &BoardId) -> Result<(), PeerError> {
        let info = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| PeerError::UnknownBoard(id.clone()))?;

        if info.is_remote {
            self.engine.unsubscribe(id).await;
        } else if info.is_shared {
            self.registry
                .with_board(id, |entry| entry.is_shared = false)
                .await;
            if let Err(e) = self.discovery.announce_unshare(id).await {
                warn!(board = %id, "unshare announcement failed: {}", e);
            }
            self.engine.stop_sharing(id).await;
        }

        self.registry.remove(id).await;
        info!(board = %id, remote = info.is_remote, "board deleted");
        Ok(())
    }

    /// Reopen the subscription of a remote board whose owner link closed
    pub async fn resubscribe(&self, id: &BoardId) -> Result<(), PeerError> {
        let reset = self
            .registry
            .with_board(id, |entry| {
                if !entry.is_remote {
                    return Err(PeerError::UnknownBoard(id.clone()));
                }
                match entry.upstream.as_ref().map(Upstream::state) {
                    Some(SubscriptionState::Closed) | None => {
                        entry.upstream = Some(Upstream::new());
                        Ok(())
                    }
                    Some(_) => Err(PeerError::StillSubscribed(id.clone())),
                }
            })
            .await
            .ok_or_else(|| PeerError::UnknownBoard(id.clone()))?;
        reset?;

        self.engine.subscribe(id.clone()).await;
        Ok(())
    }

    /// Append a path to the selected board
    pub async fn append_path_locally(&self, path: Path) -> Result<EditOutcome, PeerError> {
        self.edit_selected(LocalEdit::Append(path)).await
    }

    pub async fn undo_locally(&self) -> Result<EditOutcome, PeerError> {
        self.edit_selected(LocalEdit::Undo).await
    }

    pub async fn clear_locally(&self) -> Result<EditOutcome, PeerError> {
        self.edit_selected(LocalEdit::Clear).await
    }

    async fn edit_selected(&self, edit: LocalEdit) -> Result<EditOutcome, PeerError> {
        // The version the user saw; a broadcast may land before the edit does
        let (id, base_version) = self
            .registry
            .with_selected(|entry| (entry.id().clone(), entry.document.version()))
            .await
            .ok_or(PeerError::NoSelection)?;

        match self.engine.edit(&id, edit, base_version).await {
            EditOutcome::Discarded => {
                self.registry.redraw().await;
                Ok(EditOutcome::Discarded)
            }
            EditOutcome::NotSynced => Err(PeerError::NotSynced(id)),
            EditOutcome::UnknownBoard => Err(PeerError::UnknownBoard(id)),
            outcome => Ok(outcome),
        }
    }

    /// Run an edit against an explicit base version, as a surface that
    /// rendered an older state would
    pub async fn edit_at(
        &self,
        id: &BoardId,
        edit: LocalEdit,
        base_version: u64,
    ) -> EditOutcome {
        let outcome = self.engine.edit(id, edit, base_version).await;
        if outcome == EditOutcome::Discarded {
            self.registry.redraw().await;
        }
        outcome
    }

    /// Retract every share, leave the directory and stop serving
    pub async fn shutdown(self) {
        for id in self.registry.list_names().await {
            if let Err(e) = self.delete_board(&id).await {
                warn!(board = %id, "delete during shutdown failed: {}", e);
            }
        }
        self.discovery.close();
        for task in &self.tasks {
            task.abort();
        }
        info!(addr = %self.advertised_addr(), "peer stopped");
    }
}
