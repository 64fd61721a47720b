use crate::document::{Document, Snapshot};
use crate::replication::{Listeners, SubscriptionState, Upstream};
use crate::types::BoardId;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, watch};
use tracing::{debug, trace};

/// One row of the registry
#[derive(Debug)]
pub struct BoardEntry {
    pub document: Document,
    /// Some other peer owns the board
    pub is_remote: bool,
    /// Announced (local) or discovered (remote) as shared
    pub is_shared: bool,
    /// Peers receiving broadcasts; only used for local boards
    pub listeners: Listeners,
    /// Link to the owner; only used for remote boards
    pub upstream: Option<Upstream>,
}

impl BoardEntry {
    /// A board created here, not yet shared
    pub fn local(id: BoardId) -> Self {
        Self {
            document: Document::new(id),
            is_remote: false,
            is_shared: false,
            listeners: Listeners::new(),
            upstream: None,
        }
    }

    /// A board learned about from the directory, waiting for catch-up
    pub fn remote(id: BoardId) -> Self {
        Self {
            document: Document::new(id),
            is_remote: true,
            is_shared: true,
            listeners: Listeners::new(),
            upstream: Some(Upstream::new()),
        }
    }

    pub fn id(&self) -> &BoardId {
        self.document.id()
    }

    pub fn info(&self) -> BoardInfo {
        BoardInfo {
            snapshot: self.document.snapshot(),
            is_remote: self.is_remote,
            is_shared: self.is_shared,
            subscription: self.upstream.as_ref().map(Upstream::state),
            listeners: self.listeners.len(),
        }
    }
}

/// Read-only copy of a registry row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub snapshot: Snapshot,
    pub is_remote: bool,
    pub is_shared: bool,
    pub subscription: Option<SubscriptionState>,
    pub listeners: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    boards: BTreeMap<BoardId, BoardEntry>,
    selected: Option<BoardId>,
}

impl RegistryState {
    fn selected_snapshot(&self) -> Option<Snapshot> {
        self.selected
            .as_ref()
            .and_then(|id| self.boards.get(id))
            .map(|entry| entry.document.snapshot())
    }
}

/// All boards known to this peer plus the current selection
///
/// Every read and write goes through the single lock in here; board
/// mutations, subscription changes and broadcasts that must be atomic with
/// them all run inside [`Registry::with_board`].
pub struct Registry {
    state: RwLock<RegistryState>,
    render: watch::Sender<Option<Snapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        let (render, _) = watch::channel(None);
        Self {
            state: RwLock::new(RegistryState::default()),
            render,
        }
    }

    /// Receiver that sees the selected board's content whenever it changes
    pub fn watch_selected(&self) -> watch::Receiver<Option<Snapshot>> {
        self.render.subscribe()
    }

    fn publish(&self, state: &RegistryState, force: bool) {
        let current = state.selected_snapshot();
        self.render.send_if_modified(|shown| {
            if force || *shown != current {
                *shown = current;
                true
            } else {
                false
            }
        });
    }

    /// Insert or replace a board, optionally selecting it
    pub async fn put(&self, entry: BoardEntry, make_selected: bool) {
        let mut state = self.state.write().await;
        let id = entry.id().clone();
        debug!(board = %id, remote = entry.is_remote, "registry put");
        state.boards.insert(id.clone(), entry);
        if make_selected {
            state.selected = Some(id);
        }
        self.publish(&state, false);
    }

    /// Insert a board unless one with the same id exists
    pub async fn insert_new(&self, entry: BoardEntry, make_selected: bool) -> bool {
        let mut state = self.state.write().await;
        let id = entry.id().clone();
        if state.boards.contains_key(&id) {
            return false;
        }
        debug!(board = %id, remote = entry.is_remote, "registry insert");
        state.boards.insert(id.clone(), entry);
        if make_selected {
            state.selected = Some(id);
        }
        self.publish(&state, false);
        true
    }

    /// Remove a board; clears the selection if it pointed here
    pub async fn remove(&self, id: &BoardId) -> Option<BoardEntry> {
        let mut state = self.state.write().await;
        if state.selected.as_ref() == Some(id) {
            state.selected = None;
        }
        let removed = state.boards.remove(id);
        if removed.is_some() {
            debug!(board = %id, "registry remove");
        }
        self.publish(&state, false);
        removed
    }

    pub async fn get(&self, id: &BoardId) -> Option<BoardInfo> {
        self.state.read().await.boards.get(id).map(BoardEntry::info)
    }

    pub async fn contains(&self, id: &BoardId) -> bool {
        self.state.read().await.boards.contains_key(id)
    }

    /// Select a board; unknown ids leave the selection alone
    pub async fn select(&self, id: &BoardId) -> bool {
        let mut state = self.state.write().await;
        if !state.boards.contains_key(id) {
            trace!(board = %id, "select of unknown board ignored");
            return false;
        }
        state.selected = Some(id.clone());
        self.publish(&state, false);
        true
    }

    pub async fn selected(&self) -> Option<BoardId> {
        self.state.read().await.selected.clone()
    }

    /// Board ids in sorted order
    pub async fn list_names(&self) -> Vec<BoardId> {
        self.state.read().await.boards.keys().cloned().collect()
    }

    /// Run `f` on one board while holding the registry lock
    pub async fn with_board<R>(
        &self,
        id: &BoardId,
        f: impl FnOnce(&mut BoardEntry) -> R,
    ) -> Option<R> {
        let mut state = self.state.write().await;
        let result = state.boards.get_mut(id).map(f);
        if state.selected.as_ref() == Some(id) {
            self.publish(&state, false);
        }
        result
    }

    /// Run `f` on the selected board while holding the registry lock
    pub async fn with_selected<R>(&self, f: impl FnOnce(&mut BoardEntry) -> R) -> Option<R> {
        let mut state = self.state.write().await;
        let id = state.selected.clone()?;
        let result = state.boards.get_mut(&id).map(f);
        self.publish(&state, false);
        result
    }

    /// Run `f` on every board while holding the registry lock
    pub async fn for_each(&self, mut f: impl FnMut(&mut BoardEntry)) {
        let mut state = self.state.write().await;
        for entry in state.boards.values_mut() {
            f(entry);
        }
        self.publish(&state, false);
    }

    /// Push the selected board to the render watch even if nothing changed
    ///
    /// The drawing surface may show a stroke the document never accepted.
    pub async fn redraw(&self) {
        let state = self.state.read().await;
        self.publish(&state, true);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
