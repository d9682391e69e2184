//! Bridge between the sync engine and the backend.
//!
//! The [`RemoteStore`] owns the listen and write streams. It keeps the set
//! of active targets registered on the listen stream, replays them on
//! every reconnect with their resume tokens, and runs incoming watch
//! changes through a [`WatchChangeAggregator`]. On the write side it keeps
//! a bounded pipeline of in-flight batches that is resent after a
//! reconnect and acknowledged strictly in order.
//!
//! Nothing here calls back into the sync engine. Every entry point returns
//! the [`RemoteAction`]s the engine must apply.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::online_state::{OnlineState, OnlineStateTracker};
use crate::stream::{PersistentStream, RemoteContext, Signal};
use crate::watch::{TargetMetadataProvider, WatchChangeAggregator};
use bytes::Bytes;
use docsync_core::{
    BatchId, DocumentKeySet, LocalStore, MutationBatch, MutationBatchResult, RemoteEvent, SnapshotVersion,
    TargetData, TargetId, BATCH_ID_UNKNOWN,
};
use docsync_sync_protocol::{
    Code, ListenRequest, Status, StreamKind, StreamRequest, StreamResponse, TargetRequest, WatchChange,
    WatchTargetChangeState, WriteRequest, WriteResponse,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Work the sync engine must do in response to the backend.
#[derive(Debug)]
pub(crate) enum RemoteAction {
    /// A consistent snapshot of the listened targets.
    RemoteEvent(RemoteEvent),
    /// The backend refused to serve a target.
    RejectListen(TargetId, Status),
    /// The connectivity estimate changed.
    OnlineStateChanged(OnlineState),
    /// The oldest in-flight batch was committed.
    SuccessfulWrite(MutationBatchResult),
    /// The oldest in-flight batch was permanently rejected.
    FailedWrite(BatchId, Status),
}

/// What the remote store needs to know from the sync engine.
pub(crate) trait RemoteKeysProvider {
    /// Keys the views currently consider synced for a target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Version of the newest remote event the local store applied.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    keys: &'a dyn RemoteKeysProvider,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.keys.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the streams and their replayable state.
#[derive(Debug)]
pub(crate) struct RemoteStore {
    ctx: RemoteContext,
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    write_pipeline: VecDeque<MutationBatch>,
    max_pending_writes: usize,
    handshake_complete: bool,
    last_stream_token: Bytes,
    aggregator: Option<WatchChangeAggregator>,
    online_state: OnlineStateTracker,
    network_enabled: bool,
    shut_down: bool,
}

impl RemoteStore {
    pub(crate) fn new(ctx: RemoteContext, config: &EngineConfig) -> Self {
        Self {
            ctx,
            listen_targets: BTreeMap::new(),
            watch_stream: PersistentStream::new(StreamKind::Listen, config.stream.clone(), config.backoff.clone()),
            write_stream: PersistentStream::new(StreamKind::Write, config.stream.clone(), config.backoff.clone()),
            write_pipeline: VecDeque::new(),
            max_pending_writes: config.max_pending_writes.max(1),
            handshake_complete: false,
            last_stream_token: Bytes::new(),
            aggregator: None,
            online_state: OnlineStateTracker::new(config.online_state.clone()),
            network_enabled: false,
            shut_down: false,
        }
    }

    pub(crate) fn context(&self) -> &RemoteContext {
        &self.ctx
    }

    fn can_use_network(&self) -> bool {
        self.network_enabled && !self.shut_down
    }

    // === Network control ===

    /// Enables the network and connects whatever has work to do.
    pub(crate) fn enable_network(&mut self, local: &LocalStore) -> SyncResult<Vec<RemoteAction>> {
        let mut actions = Vec::new();
        if self.shut_down {
            return Ok(actions);
        }
        self.network_enabled = true;
        self.last_stream_token = local.get_last_stream_token();
        if self.should_start_watch_stream() {
            self.start_watch_stream(&mut actions);
        } else {
            push_change(&mut actions, self.online_state.set(OnlineState::Unknown));
        }
        self.fill_write_pipeline(local);
        Ok(actions)
    }

    /// Disables the network; the client goes offline.
    pub(crate) fn disable_network(&mut self) -> Vec<RemoteAction> {
        self.network_enabled = false;
        self.disable_network_internal();
        let mut actions = Vec::new();
        push_change(&mut actions, self.online_state.set(OnlineState::Offline));
        actions
    }

    /// Stops for good.
    pub(crate) fn shutdown(&mut self) {
        debug!("remote store shutting down");
        self.shut_down = true;
        self.disable_network_internal();
        self.online_state.set(OnlineState::Unknown);
    }

    /// Tears down both streams and reconnects them with the new token.
    pub(crate) fn handle_credential_change(&mut self, local: &LocalStore) -> SyncResult<Vec<RemoteAction>> {
        if !self.can_use_network() {
            return Ok(Vec::new());
        }
        debug!("restarting streams after a credential change");
        self.disable_network_internal();
        let mut actions = Vec::new();
        push_change(&mut actions, self.online_state.set(OnlineState::Unknown));
        actions.extend(self.enable_network(local)?);
        Ok(actions)
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop(&self.ctx);
        self.watch_stream.stop(&self.ctx);
        if !self.write_pipeline.is_empty() {
            debug!(batches = self.write_pipeline.len(), "dropping write pipeline");
            self.write_pipeline.clear();
        }
        self.aggregator = None;
    }

    // === Listen stream ===

    /// Starts listening to a target, connecting if needed.
    pub(crate) fn listen(&mut self, target_data: TargetData, keys: &dyn RemoteKeysProvider) -> Vec<RemoteAction> {
        let mut actions = Vec::new();
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return actions;
        }
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream(&mut actions);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data, keys);
        }
        actions
    }

    /// Stops listening to a target.
    pub(crate) fn unlisten(&mut self, target_id: TargetId) -> Vec<RemoteAction> {
        let mut actions = Vec::new();
        if self.listen_targets.remove(&target_id).is_none() {
            return actions;
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle(&self.ctx);
            } else if self.can_use_network() {
                // Nothing left to confirm the connection with.
                push_change(&mut actions, self.online_state.set(OnlineState::Unknown));
            }
        }
        actions
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, actions: &mut Vec<RemoteAction>) {
        self.aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start(&self.ctx);
        let on_timeout = self.ctx.deferred(Signal::OnlineStateTimeout);
        push_change(actions, self.online_state.handle_watch_stream_start(&self.ctx.queue, on_timeout));
    }

    fn send_watch_request(&mut self, target_data: TargetData, keys: &dyn RemoteKeysProvider) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = &mut self.aggregator {
            aggregator.record_pending_target_request(target_id);
        }
        let count = u32::try_from(keys.remote_keys_for_target(target_id).len()).unwrap_or(u32::MAX);
        let request = TargetRequest::from_target_data(&target_data.with_expected_count(Some(count)));
        debug!(target_id, resume = request.is_resume(), "watching target");
        self.watch_stream.write(StreamRequest::Listen(ListenRequest::AddTarget(request)));
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = &mut self.aggregator {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.write(StreamRequest::Listen(ListenRequest::RemoveTarget(target_id)));
    }

    /// Handles a signal of the listen stream or the online state timer.
    pub(crate) fn handle_listen_signal(
        &mut self,
        signal: Signal,
        keys: &dyn RemoteKeysProvider,
    ) -> SyncResult<Vec<RemoteAction>> {
        let mut actions = Vec::new();
        match signal {
            Signal::StreamOpened { generation, outgoing, .. } => {
                if self.watch_stream.on_opened(&self.ctx, generation, outgoing) {
                    let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                    for target_data in targets {
                        self.send_watch_request(target_data, keys);
                    }
                }
            }
            Signal::StreamMessage {
                generation,
                response: StreamResponse::Listen(change),
                ..
            } => {
                if self.watch_stream.on_message(&self.ctx, generation) {
                    self.watch_stream.reset_backoff();
                    self.on_watch_change(change, keys, &mut actions)?;
                }
            }
            Signal::StreamMessage { response, .. } => {
                warn!(?response, "unexpected response on the listen stream");
            }
            Signal::StreamClosed { generation, status, .. } => {
                if self.watch_stream.on_closed(&self.ctx, generation, status.as_ref()) {
                    self.on_watch_stream_close(status, &mut actions);
                }
            }
            Signal::IdleTimeout { generation, .. } => {
                if self.watch_stream.on_idle_timeout(&self.ctx, generation) {
                    self.on_watch_stream_close(None, &mut actions);
                }
            }
            Signal::HealthCheck {
                generation, watchdog, ..
            } => {
                if let Some(status) = self.watch_stream.on_health_check(&self.ctx, generation, watchdog) {
                    self.on_watch_stream_close(Some(status), &mut actions);
                }
            }
            Signal::BackoffElapsed { generation, .. } => self.watch_stream.on_backoff_elapsed(&self.ctx, generation),
            Signal::OnlineStateTimeout => push_change(&mut actions, self.online_state.handle_timeout()),
        }
        Ok(actions)
    }

    fn on_watch_stream_close(&mut self, status: Option<Status>, actions: &mut Vec<RemoteAction>) {
        self.aggregator = None;
        if self.should_start_watch_stream() {
            let reason = status.map_or_else(|| "stream closed".to_string(), |s| s.to_string());
            let on_timeout = self.ctx.deferred(Signal::OnlineStateTimeout);
            push_change(
                actions,
                self.online_state.handle_watch_stream_failure(&reason, &self.ctx.queue, on_timeout),
            );
            self.start_watch_stream(actions);
        } else {
            push_change(actions, self.online_state.set(OnlineState::Unknown));
        }
    }

    fn on_watch_change(
        &mut self,
        change: WatchChange,
        keys: &dyn RemoteKeysProvider,
        actions: &mut Vec<RemoteAction>,
    ) -> SyncResult<()> {
        push_change(actions, self.online_state.set(OnlineState::Online));

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    self.handle_target_error(&target_change.target_ids, cause, actions);
                    return Ok(());
                }
            }
        }

        let Some(aggregator) = &mut self.aggregator else {
            return Ok(());
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            keys,
        };
        let mut snapshot_version = SnapshotVersion::NONE;
        match change {
            WatchChange::Document(document_change) => aggregator.handle_document_change(document_change, &metadata),
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&filter, &metadata),
            WatchChange::Target(target_change) => {
                aggregator.handle_target_change(&target_change, &metadata);
                if target_change.target_ids.is_empty() {
                    snapshot_version = target_change.read_time;
                }
            }
        }

        if !snapshot_version.is_none() && snapshot_version >= keys.last_remote_snapshot_version() {
            self.raise_watch_snapshot(snapshot_version, keys, actions)?;
        }
        Ok(())
    }

    fn handle_target_error(&mut self, target_ids: &[TargetId], cause: &Status, actions: &mut Vec<RemoteAction>) {
        for target_id in target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                if let Some(aggregator) = &mut self.aggregator {
                    aggregator.remove_target(*target_id);
                }
                actions.push(RemoteAction::RejectListen(*target_id, cause.clone()));
            }
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        keys: &dyn RemoteKeysProvider,
        actions: &mut Vec<RemoteAction>,
    ) -> SyncResult<()> {
        let Some(aggregator) = &mut self.aggregator else {
            return Err(SyncError::Fatal("snapshot raised without an aggregator".into()));
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            keys,
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get(target_id) {
                let updated = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                self.listen_targets.insert(*target_id, updated);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Forget the token so the re-listen returns the full result set.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Bytes::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(target_data.target.clone(), *target_id, *purpose, target_data.sequence_number);
            self.send_watch_request(request, keys);
        }

        actions.push(RemoteAction::RemoteEvent(event));
        Ok(())
    }

    // === Write stream ===

    /// Moves queued batches into the pipeline and starts the write stream
    /// if there is something to send.
    pub(crate) fn fill_write_pipeline(&mut self, local: &LocalStore) {
        let mut last_batch_id = self.write_pipeline.back().map_or(BATCH_ID_UNKNOWN, |b| b.batch_id);
        while self.can_add_to_write_pipeline() {
            match local.next_mutation_batch(last_batch_id) {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle(&self.ctx);
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.handshake_complete = false;
            self.write_stream.start(&self.ctx);
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        let send = self.write_stream.is_open() && self.handshake_complete;
        if send {
            self.write_mutations(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn write_mutations(&mut self, batch: &MutationBatch) {
        debug!(batch_id = batch.batch_id, "sending batch");
        self.write_stream.write(StreamRequest::Write(WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            mutations: batch.mutations.clone(),
        }));
    }

    /// Handles a signal of the write stream.
    pub(crate) fn handle_write_signal(
        &mut self,
        signal: Signal,
        local: &mut LocalStore,
    ) -> SyncResult<Vec<RemoteAction>> {
        let mut actions = Vec::new();
        match signal {
            Signal::StreamOpened { generation, outgoing, .. } => {
                if self.write_stream.on_opened(&self.ctx, generation, outgoing) {
                    self.handshake_complete = false;
                    self.write_stream.write(StreamRequest::Write(WriteRequest::Handshake));
                }
            }
            Signal::StreamMessage {
                generation,
                response: StreamResponse::Write(response),
                ..
            } => {
                if self.write_stream.on_message(&self.ctx, generation) {
                    self.write_stream.reset_backoff();
                    self.on_write_response(response, local, &mut actions)?;
                }
            }
            Signal::StreamMessage { response, .. } => {
                warn!(?response, "unexpected response on the write stream");
            }
            Signal::StreamClosed { generation, status, .. } => {
                if self.write_stream.on_closed(&self.ctx, generation, status.as_ref()) {
                    self.on_write_stream_close(status, local, &mut actions)?;
                }
            }
            Signal::IdleTimeout { generation, .. } => {
                if self.write_stream.on_idle_timeout(&self.ctx, generation) {
                    self.on_write_stream_close(None, local, &mut actions)?;
                }
            }
            Signal::HealthCheck {
                generation, watchdog, ..
            } => {
                if let Some(status) = self.write_stream.on_health_check(&self.ctx, generation, watchdog) {
                    self.on_write_stream_close(Some(status), local, &mut actions)?;
                }
            }
            Signal::BackoffElapsed { generation, .. } => self.write_stream.on_backoff_elapsed(&self.ctx, generation),
            Signal::OnlineStateTimeout => {}
        }
        Ok(actions)
    }

    fn on_write_response(
        &mut self,
        response: WriteResponse,
        local: &mut LocalStore,
        actions: &mut Vec<RemoteAction>,
    ) -> SyncResult<()> {
        self.last_stream_token = response.stream_token.clone();
        if !self.handshake_complete {
            self.handshake_complete = true;
            local.set_last_stream_token(response.stream_token)?;
            let pipeline: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
            for batch in &pipeline {
                self.write_mutations(batch);
            }
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Err(SyncError::Fatal("write acknowledged with an empty pipeline".into()));
        };
        let result = MutationBatchResult::new(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        actions.push(RemoteAction::SuccessfulWrite(result));
        Ok(())
    }

    fn on_write_stream_close(
        &mut self,
        status: Option<Status>,
        local: &mut LocalStore,
        actions: &mut Vec<RemoteAction>,
    ) -> SyncResult<()> {
        if let Some(status) = status.filter(|_| !self.write_pipeline.is_empty()) {
            if self.handshake_complete {
                self.handle_write_error(status, actions);
            } else {
                self.handle_handshake_error(&status, local)?;
            }
        }
        if self.should_start_write_stream() {
            self.handshake_complete = false;
            self.write_stream.start(&self.ctx);
        }
        Ok(())
    }

    fn handle_handshake_error(&mut self, status: &Status, local: &mut LocalStore) -> SyncResult<()> {
        // The token may be what the backend rejected.
        if status.code.is_permanent_error() || status.code == Code::Aborted {
            debug!(code = %status.code, "resetting write stream token after handshake failure");
            self.last_stream_token = Bytes::new();
            local.set_last_stream_token(Bytes::new())?;
        }
        Ok(())
    }

    fn handle_write_error(&mut self, status: Status, actions: &mut Vec<RemoteAction>) {
        if !status.code.is_permanent_write_error() {
            return;
        }
        if let Some(batch) = self.write_pipeline.pop_front() {
            warn!(batch_id = batch.batch_id, code = %status.code, "batch rejected by the backend");
            self.write_stream.inhibit_backoff();
            actions.push(RemoteAction::FailedWrite(batch.batch_id, status));
        }
    }
}

/// Returns true if a signal belongs to the write stream.
pub(crate) fn is_write_signal(signal: &Signal) -> bool {
    let kind = match signal {
        Signal::StreamOpened { kind, .. }
        | Signal::StreamMessage { kind, .. }
        | Signal::StreamClosed { kind, .. }
        | Signal::IdleTimeout { kind, .. }
        | Signal::HealthCheck { kind, .. }
        | Signal::BackoffElapsed { kind, .. } => *kind,
        Signal::OnlineStateTimeout => return false,
    };
    kind == StreamKind::Write
}

fn push_change(actions: &mut Vec<RemoteAction>, change: Option<OnlineState>) {
    if let Some(state) = change {
        actions.push(RemoteAction::OnlineStateChanged(state));
    }
}
