//! Coordinates the local store, the remote store and the views.
//!
//! The [`SyncEngine`] owns every piece of mutable client state. It lives
//! behind a mutex and is only touched from jobs on the [`AsyncQueue`], so
//! all operations are serialized. Stream tasks and timers reach it through
//! [`Signal`]s dispatched onto the queue.
//!
//! Limbo documents (shown by a view but not confirmed by the backend) are
//! resolved by listening to each one with a single-document target. At
//! most `max_concurrent_limbo_resolutions` such targets are active; the
//! rest wait in a FIFO queue.

use crate::async_queue::AsyncQueue;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::credentials::CredentialsProvider;
use crate::error::{SyncError, SyncResult};
use crate::event_manager::{EventManager, ListenAction, ListenerId, QueryListener, UnlistenAction};
use crate::online_state::OnlineState;
use crate::remote_store::{is_write_signal, RemoteAction, RemoteKeysProvider, RemoteStore};
use crate::stream::{Dispatch, RemoteContext, Signal};
use crate::view::{LimboDocumentChange, View};
use crate::view_snapshot::{ChangeType, ViewSnapshot};
use docsync_core::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, ListenSequenceNumber, LocalStore, LocalViewChanges,
    MutableDocument, Mutation, MutationBatchResult, Query, ReferenceSet, RemoteEvent, SnapshotVersion,
    TargetChange, TargetData, TargetId, TargetIdGenerator, TargetPurpose, BATCH_ID_UNKNOWN,
};
use docsync_sync_protocol::Status;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Limbo targets are never persisted, so they carry no sequence number.
const LIMBO_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Completion of a write or of a wait for pending writes.
pub(crate) type WriteCallback = oneshot::Sender<SyncResult<()>>;

/// The engine as shared between the queue and the client handle.
pub(crate) type SharedEngine = Arc<Mutex<SyncEngine>>;

#[derive(Debug)]
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the backend has sent the document on the limbo target.
    received_document: bool,
}

/// Views and limbo targets, indexed the ways the engine looks them up.
#[derive(Debug, Default)]
struct TargetViews {
    views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
}

impl TargetViews {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.limbo_resolutions_by_target.get(&target_id) {
            return if resolution.received_document {
                DocumentKeySet::new().insert(resolution.key.clone())
            } else {
                DocumentKeySet::new()
            };
        }
        let Some(queries) = self.queries_by_target.get(&target_id) else {
            return DocumentKeySet::new();
        };
        queries
            .iter()
            .filter_map(|canonical_id| self.views_by_query.get(canonical_id))
            .fold(DocumentKeySet::new(), |keys, query_view| {
                keys.union(query_view.view.synced_documents())
            })
    }
}

struct RemoteKeys<'a> {
    local_store: &'a LocalStore,
    views: &'a TargetViews,
}

impl RemoteKeysProvider for RemoteKeys<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.views.remote_keys_for_target(target_id)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }
}

/// The client's sync state machine.
#[derive(Debug)]
pub(crate) struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    views: TargetViews,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    enqueued_limbo_keys: BTreeSet<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    pending_write_callbacks: BTreeMap<BatchId, WriteCallback>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    online_state: OnlineState,
    online_state_sender: watch::Sender<OnlineState>,
    terminated: bool,
}

impl SyncEngine {
    /// Creates the engine and wires stream signals to jobs on `queue`.
    pub(crate) fn start(
        local_store: LocalStore,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        config: &EngineConfig,
        queue: AsyncQueue,
    ) -> (SharedEngine, watch::Receiver<OnlineState>) {
        let (online_state_sender, online_state_receiver) = watch::channel(OnlineState::Unknown);
        let engine = Arc::new_cyclic(|weak: &Weak<Mutex<SyncEngine>>| {
            let ctx = RemoteContext {
                dispatch: signal_dispatch(weak.clone(), queue.clone()),
                queue,
                connection,
                credentials,
            };
            Mutex::new(SyncEngine {
                local_store,
                remote_store: RemoteStore::new(ctx, config),
                event_manager: EventManager::new(),
                views: TargetViews::default(),
                enqueued_limbo_resolutions: VecDeque::new(),
                enqueued_limbo_keys: BTreeSet::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                max_concurrent_limbo_resolutions: config.max_concurrent_limbo_resolutions.max(1),
                pending_write_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                online_state_sender,
                terminated: false,
            })
        });
        (engine, online_state_receiver)
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.terminated {
            return Err(SyncError::Terminated);
        }
        Ok(())
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }

    // === Listening ===

    /// Registers a listener, creating the query's view on first use.
    pub(crate) fn listen(&mut self, listener: QueryListener) -> SyncResult<()> {
        if self.terminated {
            listener.on_error(SyncError::Terminated);
            return Err(SyncError::Terminated);
        }
        let query = listener.query().clone();
        let result = match self.event_manager.add_listener(listener) {
            ListenAction::ListenToQuery { remote } => self
                .listen_to_query(&query, remote)
                .map(|snapshot| self.event_manager.on_watch_change(vec![snapshot])),
            ListenAction::ListenToRemoteStore => self.listen_to_remote_store(&query),
            ListenAction::None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(query = %query.canonical_id(), error = %e, "listen failed");
            self.event_manager.on_watch_error(&query, e);
        }
        result
    }

    /// Removes a listener, releasing the view after the last one.
    pub(crate) fn unlisten(&mut self, query: &Query, listener_id: ListenerId) -> SyncResult<()> {
        if self.terminated {
            return Ok(());
        }
        match self.event_manager.remove_listener(query, listener_id) {
            UnlistenAction::UnlistenFromQuery { remote } => self.unlisten_from_query(query, remote),
            UnlistenAction::UnlistenFromRemoteStore => self.unlisten_from_remote_store(query),
            UnlistenAction::None => Ok(()),
        }
    }

    fn listen_to_query(&mut self, query: &Query, remote: bool) -> SyncResult<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let snapshot =
            self.initialize_view_and_compute_snapshot(query, target_data.target_id, target_data.resume_token.clone())?;
        if remote {
            self.remote_listen(target_data)?;
        }
        Ok(snapshot)
    }

    fn listen_to_remote_store(&mut self, query: &Query) -> SyncResult<()> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        self.remote_listen(target_data)
    }

    fn remote_listen(&mut self, target_data: TargetData) -> SyncResult<()> {
        let keys = RemoteKeys {
            local_store: &self.local_store,
            views: &self.views,
        };
        let actions = self.remote_store.listen(target_data, &keys);
        self.process_remote_actions(actions)
    }

    fn remote_unlisten(&mut self, target_id: TargetId) -> SyncResult<()> {
        let actions = self.remote_store.unlisten(target_id);
        self.process_remote_actions(actions)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
        resume_token: bytes::Bytes,
    ) -> SyncResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None)?;
        // The view is not current until the backend says so.
        let synthesized = TargetChange {
            resume_token,
            current: false,
            ..TargetChange::default()
        };
        let view_change = view.apply_changes(changes, true, Some(&synthesized), false);
        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());

        let canonical_id = query.canonical_id();
        self.views.views_by_query.insert(
            canonical_id.clone(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.views.queries_by_target.entry(target_id).or_default().push(canonical_id);
        self.update_tracked_limbos(target_id, view_change.limbo_changes)?;
        Ok(snapshot)
    }

    fn unlisten_from_query(&mut self, query: &Query, remote: bool) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.views.views_by_query.remove(&canonical_id) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.views.queries_by_target.get_mut(&target_id) {
            queries.retain(|q| *q != canonical_id);
            if !queries.is_empty() {
                return Ok(());
            }
        }

        self.local_store.release_target(target_id, false)?;
        if remote {
            self.remote_unlisten(target_id)?;
        }
        self.remove_and_clean_up_target(target_id, None)
    }

    fn unlisten_from_remote_store(&mut self, query: &Query) -> SyncResult<()> {
        match self.views.views_by_query.get(&query.canonical_id()) {
            Some(query_view) => {
                let target_id = query_view.target_id;
                self.remote_unlisten(target_id)
            }
            None => Ok(()),
        }
    }

    fn remove_and_clean_up_target(&mut self, target_id: TargetId, error: Option<SyncError>) -> SyncResult<()> {
        for canonical_id in self.views.queries_by_target.remove(&target_id).unwrap_or_default() {
            if let Some(query_view) = self.views.views_by_query.remove(&canonical_id) {
                if let Some(error) = &error {
                    self.event_manager.on_watch_error(&query_view.query, error);
                }
            }
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key)?;
            }
        }
        Ok(())
    }

    /// Runs `query` against the local cache only.
    pub(crate) fn query_from_cache(&mut self, query: &Query) -> SyncResult<ViewSnapshot> {
        self.ensure_running()?;
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None)?;
        let view_change = view.apply_changes(changes, false, None, false);
        Ok(view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    /// Reads one document from the local cache, with pending writes
    /// applied.
    pub(crate) fn read_document_from_cache(&self, key: &DocumentKey) -> SyncResult<MutableDocument> {
        self.ensure_running()?;
        Ok(self.local_store.read_document(key))
    }

    // === Remote events ===

    fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.views.limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            if change.document_change_count() > 1 {
                return Err(SyncError::Fatal(format!(
                    "limbo target {target_id} reported more than one document change"
                )));
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    return Err(SyncError::Fatal(format!(
                        "limbo target {target_id} modified a document it never added"
                    )));
                }
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, status: Status) -> SyncResult<()> {
        if let Some(resolution) = self.views.limbo_resolutions_by_target.remove(&target_id) {
            // The backend will not tell us about this document. Treat it as
            // deleted so the views stop showing it.
            let key = resolution.key;
            debug!(target_id, key = %key, code = %status.code, "limbo resolution rejected");
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions()?;
            let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::NONE);
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::NONE,
                document_updates: DocumentMap::new().insert(key.clone(), tombstone),
                resolved_limbo_documents: DocumentKeySet::new().insert(key),
                ..RemoteEvent::default()
            };
            return self.apply_remote_event(event);
        }

        warn!(target_id, code = %status.code, "listen rejected by the backend");
        self.local_store.release_target(target_id, false)?;
        self.remove_and_clean_up_target(target_id, Some(SyncError::Backend(status)))
    }

    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        let mut new_snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.views.views_by_query.keys().cloned().collect();

        for canonical_id in canonical_ids {
            let Some(query_view) = self.views.views_by_query.get_mut(&canonical_id) else {
                continue;
            };
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill {
                // Documents left a limited view; re-run the query so the
                // next ones past the limit can move in.
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes))?;
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|e| e.target_changes.get(&target_id));
            let pending_reset = remote_event.is_some_and(|e| e.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, pending_reset);

            self.update_tracked_limbos(target_id, view_change.limbo_changes)?;
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(local_view_changes_from(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        self.event_manager.on_watch_change(new_snapshots);
        self.local_store.notify_local_view_changes(&local_view_changes)?;
        Ok(())
    }

    // === Limbo resolution ===

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) -> SyncResult<()> {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key)?;
                }
                LimboDocumentChange::Removed(key) => {
                    debug!(key = %key, "document left limbo");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn track_limbo_change(&mut self, key: DocumentKey) -> SyncResult<()> {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_keys.contains(&key) {
            return Ok(());
        }
        debug!(key = %key, "document entered limbo");
        self.enqueued_limbo_keys.insert(key.clone());
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions()
    }

    fn pump_enqueued_limbo_resolutions(&mut self) -> SyncResult<()> {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            self.enqueued_limbo_keys.remove(&key);
            let target_id = self.limbo_target_ids.next_id();
            debug!(key = %key, target_id, "resolving limbo document");
            self.views.limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            let target = Query::document(&key).to_target();
            let target_data = TargetData::new(target, target_id, TargetPurpose::LimboResolution, LIMBO_SEQUENCE_NUMBER);
            self.remote_listen(target_data)?;
        }
        Ok(())
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) -> SyncResult<()> {
        if self.enqueued_limbo_keys.remove(key) {
            self.enqueued_limbo_resolutions.retain(|k| k != key);
        }
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return Ok(());
        };
        self.remote_unlisten(target_id)?;
        self.views.limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions()
    }

    // === Writes ===

    /// Applies a batch locally and queues it for the backend. `callback`
    /// completes when the backend accepts or rejects it.
    pub(crate) fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) {
        if self.terminated {
            let _ = callback.send(Err(SyncError::Terminated));
            return;
        }
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "local write failed");
                let _ = callback.send(Err(e.into()));
                return;
            }
        };
        debug!(batch_id = result.batch_id, "queued local write");
        self.pending_write_callbacks.insert(result.batch_id, callback);
        let emitted = self.emit_new_snaps_and_notify_local_store(&result.changes, None);
        self.handle_result(emitted);
        self.remote_store.fill_write_pipeline(&self.local_store);
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch.batch_id;
        debug!(batch_id, commit_version = %result.commit_version, "batch acknowledged");
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        Ok(())
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, status: Status) -> SyncResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(SyncError::Backend(status)));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        Ok(())
    }

    /// Completes `callback` once every write queued so far is acknowledged
    /// or rejected.
    pub(crate) fn register_pending_writes_callback(&mut self, callback: WriteCallback) {
        if self.terminated {
            let _ = callback.send(Err(SyncError::Terminated));
            return;
        }
        let highest = self.local_store.get_highest_unacknowledged_batch_id();
        if highest == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        if self.online_state == OnlineState::Offline {
            debug!("waiting for pending writes while offline; completes once the network is back");
        }
        self.pending_writes_callbacks.entry(highest).or_default().push(callback);
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: SyncResult<()>) {
        if let Some(callback) = self.pending_write_callbacks.remove(&batch_id) {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        if let Some(callbacks) = self.pending_writes_callbacks.remove(&batch_id) {
            for callback in callbacks {
                let _ = callback.send(Ok(()));
            }
        }
    }

    fn reject_outstanding_callbacks(&mut self, error: &SyncError) {
        for (_, callback) in std::mem::take(&mut self.pending_write_callbacks) {
            let _ = callback.send(Err(error.duplicate()));
        }
        for (_, callbacks) in std::mem::take(&mut self.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(error.duplicate()));
            }
        }
    }

    // === Network and lifecycle ===

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        info!(%online_state, "online state changed");
        self.online_state = online_state;
        let mut new_snapshots = Vec::new();
        for query_view in self.views.views_by_query.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            if let Some(snapshot) = view_change.snapshot {
                new_snapshots.push(snapshot);
            }
        }
        self.event_manager.on_watch_change(new_snapshots);
        self.event_manager.on_online_state_change(online_state);
        self.online_state_sender.send_replace(online_state);
    }

    pub(crate) fn enable_network(&mut self) -> SyncResult<()> {
        self.ensure_running()?;
        let actions = self.remote_store.enable_network(&self.local_store)?;
        self.process_remote_actions(actions)
    }

    pub(crate) fn disable_network(&mut self) -> SyncResult<()> {
        self.ensure_running()?;
        let actions = self.remote_store.disable_network();
        self.process_remote_actions(actions)
    }

    /// Reconnects both streams with fresh credentials.
    pub(crate) fn handle_credential_change(&mut self) -> SyncResult<()> {
        self.ensure_running()?;
        let actions = self.remote_store.handle_credential_change(&self.local_store)?;
        self.process_remote_actions(actions)
    }

    /// Stops the engine. Pending callbacks and listeners fail with
    /// [`SyncError::Terminated`].
    pub(crate) fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        info!("terminating sync engine");
        self.terminated = true;
        self.remote_store.shutdown();
        self.reject_outstanding_callbacks(&SyncError::Terminated);
        self.event_manager.fail_all(&SyncError::Terminated);
        self.online_state_sender.send_replace(OnlineState::Unknown);
    }

    fn fail_fatally(&mut self, error: SyncError) {
        error!(error = %error, "sync engine stopped after an internal error");
        self.terminated = true;
        self.remote_store.shutdown();
        self.remote_store.context().queue.enter_restricted_mode();
        self.reject_outstanding_callbacks(&error);
        self.event_manager.fail_all(&error);
    }

    /// Logs a failed internal step; fatal failures stop the engine.
    fn handle_result(&mut self, result: SyncResult<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.fail_fatally(e),
            Err(e) => warn!(error = %e, "sync step failed"),
        }
    }

    /// Handles a stream or timer signal.
    pub(crate) fn handle_signal(&mut self, signal: Signal) {
        if self.terminated {
            return;
        }
        let result = if is_write_signal(&signal) {
            self.remote_store.handle_write_signal(signal, &mut self.local_store)
        } else {
            let keys = RemoteKeys {
                local_store: &self.local_store,
                views: &self.views,
            };
            self.remote_store.handle_listen_signal(signal, &keys)
        };
        let result = result.and_then(|actions| self.process_remote_actions(actions));
        self.handle_result(result);
    }

    fn process_remote_actions(&mut self, actions: Vec<RemoteAction>) -> SyncResult<()> {
        for action in actions {
            match action {
                RemoteAction::RemoteEvent(event) => self.apply_remote_event(event)?,
                RemoteAction::RejectListen(target_id, status) => self.reject_listen(target_id, status)?,
                RemoteAction::OnlineStateChanged(state) => self.apply_online_state_change(state),
                RemoteAction::SuccessfulWrite(result) => self.apply_successful_write(result)?,
                RemoteAction::FailedWrite(batch_id, status) => self.reject_failed_write(batch_id, status)?,
            }
        }
        Ok(())
    }
}

/// Builds the dispatch callback that turns signals into engine jobs.
fn signal_dispatch(engine: Weak<Mutex<SyncEngine>>, queue: AsyncQueue) -> Dispatch {
    Arc::new(move |signal: Signal| {
        let engine = engine.clone();
        queue.enqueue_and_forget(async move {
            if let Some(engine) = engine.upgrade() {
                engine.lock().handle_signal(signal);
            }
        });
    })
}

fn local_view_changes_from(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.doc_changes {
        match change.kind {
            ChangeType::Added => changes.added_keys = changes.added_keys.insert(change.doc.key().clone()),
            ChangeType::Removed => changes.removed_keys = changes.removed_keys.insert(change.doc.key().clone()),
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}
