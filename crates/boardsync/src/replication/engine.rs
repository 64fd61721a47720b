use crate::config::ReplicationConfig;
use crate::document::{LocalEdit, Snapshot, SnapshotError, UpdateOp};
use crate::protocol::Message;
use crate::registry::Registry;
use crate::replication::{SubscriptionState, Upstream};
use crate::transport::{Connection, ConnectionId, Inbound, PeerLink};
use crate::types::BoardId;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Result of a locally originated edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Applied to a board owned here, and broadcast if shared
    Applied,
    /// Applied to a replica and sent to the owner for acceptance
    Proposed,
    /// Another mutation got there first; nothing changed
    Discarded,
    /// The replica is not synced with its owner, edits are refused
    NotSynced,
    UnknownBoard,
}

enum ProposalError {
    UnknownBoard,
    NotShared,
    Stale { base: u64, current: u64 },
    Malformed(SnapshotError),
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalError::UnknownBoard => f.write_str("unknown board"),
            ProposalError::NotShared => f.write_str("board is not shared by this peer"),
            ProposalError::Stale { base, current } => write!(
                f,
                "stale version: update built on version {} but board is at version {}",
                base, current
            ),
            ProposalError::Malformed(e) => write!(f, "malformed update: {}", e),
        }
    }
}

enum BroadcastOutcome {
    Applied(u64),
    AlreadyApplied,
    Diverged,
    NotSynced,
    Malformed(SnapshotError),
}

/// Optimistic-concurrency replication between board owners and subscribers
///
/// Owner role: serves snapshots, keeps listener sets, judges proposals and
/// broadcasts every accepted mutation. Subscriber role: one outbound link per
/// remote board, catch-up handshake, guarded application of broadcasts and
/// full re-bootstrap whenever the replica falls out of step.
pub struct ReplicationEngine {
    registry: Arc<Registry>,
    config: ReplicationConfig,
}

impl ReplicationEngine {
    pub fn new(registry: Arc<Registry>, config: ReplicationConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept peer connections until the listener fails
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Peer listener on {}", addr),
            Err(e) => warn!("Peer listener address unknown: {}", e),
        }

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                    continue;
                }
            };
            debug!("Peer connection from {}", peer_addr);
            let _ = socket.set_nodelay(true);
            self.accept(socket, peer_addr.to_string());
        }
    }

    /// Serve one inbound connection (this peer is the owner side)
    pub fn accept<S>(self: &Arc<Self>, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, inbound) = Connection::spawn(stream, remote, self.config.max_frame_bytes);
        tokio::spawn(Arc::clone(self).serve_inbound(link, inbound));
    }

    async fn serve_inbound(self: Arc<Self>, link: PeerLink, mut inbound: Inbound) {
        while let Some(next) = inbound.next().await {
            match next {
                Ok(msg) => self.handle_inbound(&link, msg).await,
                Err(e) => reply_error(&link, e.to_string()),
            }
        }
        self.inbound_closed(link.id()).await;
        link.close();
    }

    /// Dispatch one message received on an inbound connection
    pub async fn handle_inbound(&self, link: &PeerLink, msg: Message) {
        match msg {
            Message::GetBoardData(id) => self.on_get_board_data(link, id).await,
            Message::Listen(id) => self.on_listen(link, id).await,
            Message::Unlisten(id) => self.on_unlisten(link, id).await,
            Message::Update { op, snapshot } => self.on_proposal(link, op, snapshot).await,
            Message::Error(text) => warn!(conn = %link.id(), "peer reported: {}", text),
            other => reply_error(
                link,
                format!("unexpected {} on an owner connection", other.event()),
            ),
        }
    }

    async fn on_get_board_data(&self, link: &PeerLink, id: BoardId) {
        let snapshot = self
            .registry
            .with_board(&id, |entry| {
                (!entry.is_remote && entry.is_shared).then(|| entry.document.snapshot())
            })
            .await
            .flatten();

        match snapshot {
            Some(snapshot) => {
                debug!(board = %id, version = snapshot.version, conn = %link.id(), "serving snapshot");
                let _ = link.send(Message::BoardData(snapshot));
            }
            None => debug!(board = %id, conn = %link.id(), "snapshot request for a board not shared here"),
        }
    }

    async fn on_listen(&self, link: &PeerLink, id: BoardId) {
        let registered = self
            .registry
            .with_board(&id, |entry| {
                if entry.is_remote || !entry.is_shared {
                    return false;
                }
                entry.listeners.insert(link.clone());
                // Covers mutations accepted between the catch-up snapshot and now
                let _ = link.send(Message::BoardData(entry.document.snapshot()));
                true
            })
            .await
            .unwrap_or(false);

        if registered {
            info!(board = %id, conn = %link.id(), remote = %link.remote(), "listener added");
        } else {
            reply_error(link, format!("cannot listen to {}: not shared by this peer", id));
        }
    }

    async fn on_unlisten(&self, link: &PeerLink, id: BoardId) {
        let removed = self
            .registry
            .with_board(&id, |entry| entry.listeners.remove(link.id()))
            .await
            .unwrap_or(false);
        if removed {
            info!(board = %id, conn = %link.id(), "listener removed");
        }
    }

    async fn on_proposal(&self, link: &PeerLink, op: UpdateOp, snapshot: Snapshot) {
        let id = snapshot.id.clone();
        let outcome = self
            .registry
            .with_board(&id, |entry| {
                if entry.is_remote || !entry.is_shared {
                    return Err(ProposalError::NotShared);
                }
                let current = entry.document.version();
                match entry.document.apply_update(op, &snapshot) {
                    Ok(true) => {
                        let accepted = entry.document.snapshot();
                        let reached = entry.listeners.broadcast(&Message::Update {
                            op,
                            snapshot: accepted.clone(),
                        });
                        let version = accepted.version;
                        let _ = link.send(Message::Accepted {
                            op,
                            snapshot: accepted,
                        });
                        Ok((version, reached))
                    }
                    Ok(false) => Err(ProposalError::Stale {
                        base: snapshot.version - 1,
                        current,
                    }),
                    Err(e) => Err(ProposalError::Malformed(e)),
                }
            })
            .await
            .unwrap_or(Err(ProposalError::UnknownBoard));

        match outcome {
            Ok((version, reached)) => info!(
                board = %id, %op, version, listeners = reached, conn = %link.id(),
                "accepted proposal"
            ),
            Err(e) => reply_error(link, format!("{} rejected for {}: {}", op, id, e)),
        }
    }

    async fn inbound_closed(&self, conn: ConnectionId) {
        self.registry
            .for_each(|entry| {
                if entry.listeners.remove(conn) {
                    info!(board = %entry.id(), conn = %conn, "listener gone with its connection");
                }
            })
            .await;
    }

    /// Apply a local user edit made on top of `base_version`
    ///
    /// Owned boards broadcast the accepted state to their listeners. Remote
    /// boards apply speculatively and propose the result to the owner.
    pub async fn edit(&self, id: &BoardId, edit: LocalEdit, base_version: u64) -> EditOutcome {
        let op = edit.op();
        self.registry
            .with_board(id, |entry| {
                if entry.is_remote && !entry.upstream.as_ref().is_some_and(Upstream::is_synced) {
                    return EditOutcome::NotSynced;
                }
                if !entry.document.apply_edit(edit, base_version) {
                    debug!(board = %id, %op, base_version, "local edit lost the race");
                    return EditOutcome::Discarded;
                }
                let msg = Message::Update {
                    op,
                    snapshot: entry.document.snapshot(),
                };

                if !entry.is_remote {
                    // Listeners may linger on a board whose unshare is still in flight
                    let reached = if entry.is_shared {
                        entry.listeners.broadcast(&msg)
                    } else {
                        0
                    };
                    debug!(board = %id, %op, listeners = reached, "local edit applied");
                    return EditOutcome::Applied;
                }

                if let Some(upstream) = entry.upstream.as_mut() {
                    let sent = upstream.link().is_some_and(|link| link.send(msg).is_ok());
                    if !sent {
                        warn!(board = %id, "owner link gone while proposing");
                        upstream.mark_closed();
                    }
                }
                debug!(board = %id, %op, base_version, "proposed to owner");
                EditOutcome::Proposed
            })
            .await
            .unwrap_or(EditOutcome::UnknownBoard)
    }

    /// Drop every listener of a board this peer stops sharing
    pub async fn stop_sharing(&self, id: &BoardId) {
        let farewell = Message::Deleted(id.clone());
        self.registry
            .with_board(id, |entry| entry.listeners.drain_with(&farewell))
            .await;
        info!(board = %id, "listeners dropped");
    }

    /// Start the catch-up handshake with the owner of `id`
    pub async fn subscribe(self: &Arc<Self>, id: BoardId) {
        let addr = id.owner_addr();
        info!(board = %id, owner = %addr, "subscribing");
        match Connection::connect(
            &addr,
            self.config.connect_timeout(),
            self.config.max_frame_bytes,
        )
        .await
        {
            Ok((link, inbound)) => {
                self.attach_upstream(id, link, inbound).await;
            }
            Err(e) => {
                warn!(board = %id, "owner unreachable: {}", e);
                self.registry
                    .with_board(&id, |entry| {
                        if let Some(upstream) = entry.upstream.as_mut() {
                            upstream.mark_closed();
                        }
                    })
                    .await;
            }
        }
    }

    /// Subscribe to `id` over an already established byte stream
    pub async fn subscribe_over<S>(self: &Arc<Self>, id: BoardId, stream: S, remote: String) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, inbound) = Connection::spawn(stream, remote, self.config.max_frame_bytes);
        self.attach_upstream(id, link, inbound).await
    }

    async fn attach_upstream(self: &Arc<Self>, id: BoardId, link: PeerLink, inbound: Inbound) -> bool {
        let reader = tokio::spawn(Arc::clone(self).serve_upstream(id.clone(), link.clone(), inbound));
        let attached = self
            .registry
            .with_board(&id, |entry| match entry.upstream.as_mut() {
                Some(upstream) if upstream.state() != SubscriptionState::Closed => {
                    upstream.attach(link.clone(), reader.abort_handle());
                    upstream.request_snapshot(&id);
                    true
                }
                _ => false,
            })
            .await
            .unwrap_or(false);

        if !attached {
            debug!(board = %id, "subscription dropped before the owner answered");
            reader.abort();
            link.close();
        }
        attached
    }

    async fn serve_upstream(self: Arc<Self>, id: BoardId, link: PeerLink, mut inbound: Inbound) {
        while let Some(next) = inbound.next().await {
            match next {
                Ok(msg) => self.handle_upstream(&id, &link, msg).await,
                Err(e) => reply_error(&link, e.to_string()),
            }
        }

        let closed = self
            .registry
            .with_board(&id, |entry| match entry.upstream.as_mut() {
                Some(upstream) if upstream.is_on(link.id()) => {
                    upstream.mark_closed();
                    true
                }
                _ => false,
            })
            .await
            .unwrap_or(false);
        if closed {
            info!(board = %id, "owner connection lost; replica kept read-only");
        }
        link.close();
    }

    /// Dispatch one message received on the subscription link for `id`
    pub async fn handle_upstream(&self, id: &BoardId, link: &PeerLink, msg: Message) {
        if let Some(other) = msg.board_id() {
            if other != id {
                reply_error(link, format!("message for {} on the link for {}", other, id));
                return;
            }
        }

        match msg {
            Message::BoardData(snapshot) => self.on_snapshot(id, snapshot).await,
            Message::Update { op, snapshot } => self.on_broadcast(id, link, op, snapshot).await,
            Message::Accepted { op, snapshot } => self.on_accepted(id, op, snapshot).await,
            Message::Deleted(_) => self.on_owner_deleted(id).await,
            Message::Error(text) => self.on_owner_error(id, text).await,
            other => reply_error(
                link,
                format!("unexpected {} on a subscription link", other.event()),
            ),
        }
    }

    async fn on_snapshot(&self, id: &BoardId, snapshot: Snapshot) {
        let version = snapshot.version;
        let bootstrapped = self
            .registry
            .with_board(id, |entry| {
                let Some(upstream) = entry.upstream.as_mut() else {
                    return false;
                };
                if upstream.state() == SubscriptionState::Closed {
                    return false;
                }
                if entry.document.bootstrap(snapshot).is_err() {
                    return false;
                }
                upstream.mark_synced(id);
                true
            })
            .await
            .unwrap_or(false);

        if bootstrapped {
            info!(board = %id, version, "replica bootstrapped");
        } else {
            debug!(board = %id, "snapshot ignored");
        }
    }

    async fn on_broadcast(&self, id: &BoardId, link: &PeerLink, op: UpdateOp, snapshot: Snapshot) {
        let outcome = self
            .registry
            .with_board(id, |entry| {
                let Some(upstream) = entry.upstream.as_mut() else {
                    return BroadcastOutcome::NotSynced;
                };
                if !upstream.is_synced() {
                    return BroadcastOutcome::NotSynced;
                }
                match entry.document.apply_update(op, &snapshot) {
                    Ok(true) => BroadcastOutcome::Applied(entry.document.version()),
                    Ok(false) if entry.document.has_seen(&snapshot) => {
                        BroadcastOutcome::AlreadyApplied
                    }
                    Ok(false) => {
                        upstream.request_snapshot(id);
                        BroadcastOutcome::Diverged
                    }
                    Err(e) => BroadcastOutcome::Malformed(e),
                }
            })
            .await;

        match outcome {
            Some(BroadcastOutcome::Applied(version)) => {
                debug!(board = %id, %op, version, "broadcast applied")
            }
            Some(BroadcastOutcome::AlreadyApplied) => {
                debug!(board = %id, %op, version = snapshot.version, "broadcast already applied")
            }
            Some(BroadcastOutcome::Diverged) => {
                warn!(board = %id, %op, version = snapshot.version, "replica out of step, re-bootstrapping")
            }
            Some(BroadcastOutcome::NotSynced) | None => {
                debug!(board = %id, %op, "broadcast ignored")
            }
            Some(BroadcastOutcome::Malformed(e)) => {
                reply_error(link, format!("malformed {} broadcast for {}: {}", op, id, e))
            }
        }
    }

    async fn on_accepted(&self, id: &BoardId, op: UpdateOp, snapshot: Snapshot) {
        let diverged = self
            .registry
            .with_board(id, |entry| {
                let Some(upstream) = entry.upstream.as_mut() else {
                    return false;
                };
                let doc = &entry.document;
                let diverged = doc.version() < snapshot.version
                    || (doc.version() == snapshot.version
                        && doc.history() != snapshot.paths.as_slice());
                if diverged && upstream.is_synced() {
                    upstream.request_snapshot(id);
                }
                diverged
            })
            .await
            .unwrap_or(false);

        if diverged {
            warn!(board = %id, %op, version = snapshot.version, "accepted state differs from replica, re-bootstrapping");
        } else {
            debug!(board = %id, %op, version = snapshot.version, "owner accepted proposal");
        }
    }

    async fn on_owner_deleted(&self, id: &BoardId) {
        self.registry
            .with_board(id, |entry| {
                if let Some(upstream) = entry.upstream.as_mut() {
                    upstream.close(id);
                }
            })
            .await;
        info!(board = %id, "owner stopped sharing; replica kept read-only");
    }

    async fn on_owner_error(&self, id: &BoardId, text: String) {
        warn!(board = %id, "owner reported: {}", text);
        self.registry
            .with_board(id, |entry| {
                if let Some(upstream) = entry.upstream.as_mut() {
                    if upstream.is_synced() {
                        upstream.request_snapshot(id);
                    }
                }
            })
            .await;
    }

    /// Close the subscription link for a remote board
    pub async fn unsubscribe(&self, id: &BoardId) {
        self.registry
            .with_board(id, |entry| {
                if let Some(upstream) = entry.upstream.as_mut() {
                    upstream.close(id);
                }
            })
            .await;
        info!(board = %id, "unsubscribed");
    }
}

fn reply_error(link: &PeerLink, text: String) {
    warn!(conn = %link.id(), remote = %link.remote(), "protocol error: {}", text);
    let _ = link.send(Message::Error(text));
}
