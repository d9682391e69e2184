//! Fans view snapshots out to query listeners.

use crate::error::{SyncError, SyncResult};
use crate::online_state::OnlineState;
use crate::view_snapshot::{ChangeType, ViewSnapshot};
use docsync_core::Query;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Where a listener's results come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// The local cache, kept up to date by the backend.
    #[default]
    Default,
    /// The local cache only; the backend is never asked.
    Cache,
}

/// Options of a snapshot listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is pending-write or cache state.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while online until it is synced.
    pub wait_for_sync_when_online: bool,
    /// Where results come from.
    pub source: ListenSource,
}

impl ListenOptions {
    /// Sets whether metadata-only snapshots are raised.
    #[must_use]
    pub fn with_include_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    /// Sets whether the first snapshot waits for the backend.
    #[must_use]
    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: ListenSource) -> Self {
        self.source = source;
        self
    }
}

pub(crate) type ListenerId = u64;

/// Decides which snapshots one listener sees.
#[derive(Debug)]
pub(crate) struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    sender: mpsc::UnboundedSender<SyncResult<ViewSnapshot>>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub(crate) fn new(
        id: ListenerId,
        query: Query,
        options: ListenOptions,
        sender: mpsc::UnboundedSender<SyncResult<ViewSnapshot>>,
    ) -> Self {
        Self {
            id,
            query,
            options,
            sender,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    fn listens_to_remote(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns true if an event was raised.
    fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot) -> bool {
        if !self.options.include_metadata_changes {
            snapshot.doc_changes.retain(|c| c.kind != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }
        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.emit(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub(crate) fn on_error(&self, error: SyncError) {
        self.emit(Err(error));
    }

    /// Returns true if the change released a held-back initial snapshot.
    fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        match &self.snapshot {
            Some(snapshot) if !self.raised_initial_event && self.should_raise_initial_event(snapshot, online_state) => {
                let snapshot = snapshot.clone();
                self.raise_initial_event(&snapshot);
                true
            }
            _ => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        // Unknown counts as online: it resolves one way or the other.
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.emit(Ok(initial));
    }

    fn emit(&self, event: SyncResult<ViewSnapshot>) {
        // A closed receiver means the registration is being dropped.
        let _ = self.sender.send(event);
    }
}

/// What the sync engine must do after a listener was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenAction {
    /// First listener of the query: create the view.
    ListenToQuery { remote: bool },
    /// First listener that needs the backend for an existing view.
    ListenToRemoteStore,
    None,
}

/// What the sync engine must do after a listener was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnlistenAction {
    /// Last listener of the query: release the view.
    UnlistenFromQuery { remote: bool },
    /// Last listener that needed the backend; the view stays.
    UnlistenFromRemoteStore,
    None,
}

#[derive(Debug, Default)]
struct QueryListenersInfo {
    snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(QueryListener::listens_to_remote)
    }
}

/// Listeners grouped by query.
#[derive(Debug, Default)]
pub(crate) struct EventManager {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl EventManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a listener, raising the query's last snapshot to it if
    /// there is one.
    pub(crate) fn add_listener(&mut self, mut listener: QueryListener) -> ListenAction {
        let info = self.queries.entry(listener.query.canonical_id()).or_default();
        let first = info.listeners.is_empty();
        let had_remote = info.has_remote_listeners();

        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = info.snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        let remote = listener.listens_to_remote();
        info.listeners.push(listener);

        if first {
            ListenAction::ListenToQuery { remote }
        } else if remote && !had_remote {
            ListenAction::ListenToRemoteStore
        } else {
            ListenAction::None
        }
    }

    /// Removes a listener.
    pub(crate) fn remove_listener(&mut self, query: &Query, id: ListenerId) -> UnlistenAction {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return UnlistenAction::None;
        };
        let Some(position) = info.listeners.iter().position(|l| l.id == id) else {
            return UnlistenAction::None;
        };
        let removed = info.listeners.remove(position);
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return UnlistenAction::UnlistenFromQuery {
                remote: removed.listens_to_remote(),
            };
        }
        if removed.listens_to_remote() && !info.has_remote_listeners() {
            return UnlistenAction::UnlistenFromRemoteStore;
        }
        UnlistenAction::None
    }

    /// Delivers new snapshots to the listeners of their queries.
    pub(crate) fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            if let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) {
                for listener in &mut info.listeners {
                    listener.on_view_snapshot(snapshot.clone());
                }
                info.snapshot = Some(snapshot);
            }
        }
    }

    /// Fails every listener of `query` and forgets them.
    pub(crate) fn on_watch_error(&mut self, query: &Query, error: &SyncError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.duplicate());
            }
        }
    }

    /// Fails every listener and forgets them.
    pub(crate) fn fail_all(&mut self, error: &SyncError) {
        for (_, info) in std::mem::take(&mut self.queries) {
            for listener in &info.listeners {
                listener.on_error(error.duplicate());
            }
        }
    }

    pub(crate) fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.queries.values().map(|info| info.listeners.len()).sum()
    }
}
