//! The local store: the single writer of all locally cached state.

use super::persistence::{Persistence, Transaction};
use super::query_engine::{QueryEngine, QueryStrategy};
use super::reference_set::ReferenceSet;
use super::target_cache::TargetIdGenerator;
use super::target_data::{TargetData, TargetPurpose};
use crate::config::LocalStoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::local::FieldIndex;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion, TargetId,
};
use crate::mutation::{Mutation, MutationBatch, MutationBatchResult};
use crate::query::{Query, Target};
use crate::remote_event::{RemoteEvent, TargetChange};
use bytes::Bytes;
use docsync_codec::Timestamp;
use docsync_storage::KvStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Result of [`LocalStore::write_locally`].
#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    /// Id of the queued batch.
    pub batch_id: BatchId,
    /// Local view of every written document.
    pub changes: DocumentMap,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Matching documents, unsorted and unlimited.
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: DocumentKeySet,
    /// How the query was answered.
    pub strategy: QueryStrategy,
}

/// Changes to the documents a view displays, reported back so the store
/// keeps them pinned.
#[derive(Debug, Clone, Default)]
pub struct LocalViewChanges {
    /// The view's target.
    pub target_id: TargetId,
    /// Whether the view's snapshot was from cache.
    pub from_cache: bool,
    /// Keys that entered the view.
    pub added_keys: DocumentKeySet,
    /// Keys that left the view.
    pub removed_keys: DocumentKeySet,
}

/// Local cache of remote documents, pending writes and targets.
///
/// Every operation runs in its own transaction and is all-or-nothing.
pub struct LocalStore {
    persistence: Persistence,
    config: LocalStoreConfig,
    query_engine: QueryEngine,
    local_view_references: ReferenceSet,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    target_id_generator: TargetIdGenerator,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("persistence", &self.persistence)
            .field("active_targets", &self.target_data_by_target.len())
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Creates a local store over already opened persistence.
    pub fn new(persistence: Persistence, config: LocalStoreConfig) -> Self {
        let highest = persistence.state().targets.highest_target_id();
        Self {
            persistence,
            query_engine: QueryEngine::new(config.query_engine.clone()),
            config,
            local_view_references: ReferenceSet::new(),
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(highest),
        }
    }

    /// Opens a local store over a durable key-value store.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state is corrupted.
    pub fn open(store: Arc<dyn KvStore>, config: LocalStoreConfig) -> CoreResult<Self> {
        Ok(Self::new(Persistence::open(store)?, config))
    }

    /// Creates a local store that keeps everything in memory.
    pub fn memory_only(config: LocalStoreConfig) -> Self {
        Self::new(Persistence::memory_only(), config)
    }

    /// Returns true if nothing is persisted durably.
    pub fn is_memory_only(&self) -> bool {
        self.persistence.is_memory_only()
    }

    fn commit(&mut self, mut txn: Transaction) -> CoreResult<()> {
        self.collect_garbage(&mut txn);
        self.persistence.commit(txn)
    }

    /// Evicts orphaned documents that no target, batch or view references.
    fn collect_garbage(&self, txn: &mut Transaction) {
        for key in std::mem::take(&mut txn.orphaned) {
            let state = &mut txn.state;
            if state.targets.contains_key(&key)
                || state.mutation_queue.contains_key(&key)
                || self.local_view_references.contains_key(&key)
            {
                continue;
            }
            if state.remote_documents.contains_key(&key) {
                trace!(key = %key, "evicting unreferenced document");
            }
            state.remote_documents.remove(&mut txn.writes, &key);
            state.indexes.remove_document(&key);
        }
    }

    /// Queues `mutations` as one batch and returns their local effect.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty batch or an invalid
    /// mutation; nothing is written in that case.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> CoreResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(CoreError::validation("a write batch needs at least one mutation"));
        }
        for mutation in &mutations {
            mutation.validate()?;
        }
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();
        let mut txn = self.persistence.begin("write_locally");

        let remote_docs = txn.state.remote_documents.get_all(&keys);
        let without_remote_version: DocumentKeySet = remote_docs
            .iter()
            .filter(|(_, doc)| !doc.is_valid_document())
            .map(|(key, _)| key.clone())
            .collect();
        let mut overlayed = txn.local_view().get_overlayed_documents(&remote_docs);

        let batch = txn
            .state
            .mutation_queue
            .add_mutation_batch(&mut txn.writes, Timestamp::now(), mutations)?;
        let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
        txn.state
            .overlays
            .save_overlays(&mut txn.writes, batch.batch_id, &overlays)?;

        let changes = overlayed
            .into_iter()
            .fold(DocumentMap::new(), |map, (key, doc)| map.insert(key, doc.document));
        self.commit(txn)?;
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Applies the backend's acknowledgement of the oldest queued batch.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the batch is not the oldest queued batch or
    /// the results are malformed.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> CoreResult<DocumentMap> {
        let batch = &result.batch;
        let keys = batch.keys();
        let mut txn = self.persistence.begin("acknowledge_batch");

        for key in keys.iter() {
            let mut doc = txn.state.remote_documents.get(key);
            let Some(ack_version) = result.doc_versions.get(key).copied() else {
                return Err(CoreError::fatal(format!("no acknowledged version for {key}")));
            };
            if doc.version() < ack_version {
                batch.apply_to_remote_document(&mut doc, result)?;
                if doc.is_valid_document() {
                    doc.set_read_time(result.commit_version);
                    txn.state.indexes.update_index_entries([&doc], result.commit_version);
                    txn.state.remote_documents.add(&mut txn.writes, doc)?;
                }
            }
        }
        txn.state
            .mutation_queue
            .remove_mutation_batch(&mut txn.writes, batch)?;
        txn.state
            .mutation_queue
            .set_last_stream_token(&mut txn.writes, result.stream_token.clone())?;
        txn.state.mutation_queue.check_empty()?;

        let changes = self.finish_batch_removal(&mut txn, batch)?;
        self.commit(txn)?;
        debug!(batch_id = batch.batch_id, "acknowledged batch");
        Ok(changes)
    }

    /// Drops a batch the backend rejected.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the batch is unknown or not the oldest.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> CoreResult<DocumentMap> {
        let mut txn = self.persistence.begin("reject_batch");
        let batch = txn
            .state
            .mutation_queue
            .lookup_mutation_batch(batch_id)
            .cloned()
            .ok_or_else(|| CoreError::fatal(format!("rejected batch {batch_id} is not queued")))?;
        txn.state
            .mutation_queue
            .remove_mutation_batch(&mut txn.writes, &batch)?;
        txn.state.mutation_queue.check_empty()?;

        let changes = self.finish_batch_removal(&mut txn, &batch)?;
        self.commit(txn)?;
        debug!(batch_id, "rejected batch");
        Ok(changes)
    }

    fn finish_batch_removal(
        &self,
        txn: &mut Transaction,
        batch: &MutationBatch,
    ) -> CoreResult<DocumentMap> {
        let keys = batch.keys();
        txn.state
            .overlays
            .remove_overlays_for_batch_id(&mut txn.writes, &keys, batch.batch_id);
        txn.recalculate_and_save_overlays(&keys)?;
        let changes = txn.local_view().get_documents(&keys);
        for key in keys.iter() {
            txn.mark_orphaned(key.clone());
        }
        Ok(changes)
    }

    /// Applies a consistent snapshot of watch changes.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the event is older than the last applied
    /// one.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> CoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let mut txn = self.persistence.begin("apply_remote_event");
        let sequence_number = txn.state.targets.highest_listen_sequence_number();
        let mut updated_targets = Vec::new();

        for (target_id, change) in &event.target_changes {
            let Some(old) = self.target_data_by_target.get(target_id) else {
                continue;
            };
            txn.state
                .targets
                .remove_matching_keys(&mut txn.writes, change.removed_documents.iter(), *target_id);
            for key in change.removed_documents.iter() {
                txn.mark_orphaned(key.clone());
            }
            txn.state
                .targets
                .add_matching_keys(&mut txn.writes, change.added_documents.iter(), *target_id);

            let mismatch = event.target_mismatches.contains_key(target_id);
            let mut updated = old.with_sequence_number(sequence_number);
            if mismatch {
                updated = updated
                    .with_resume_token(Bytes::new(), SnapshotVersion::NONE)
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::NONE);
            } else if !change.resume_token.is_empty() {
                updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
            }
            if mismatch || self.should_persist_target_data(old, &updated, change) {
                txn.state
                    .targets
                    .update_target_data(&mut txn.writes, updated.clone())?;
            }
            updated_targets.push(updated);
        }

        let mut changed = DocumentMap::new();
        for (key, doc) in event.document_updates.iter() {
            let existing = txn.state.remote_documents.get(key);
            if doc.is_no_document() && doc.version() == SnapshotVersion::NONE {
                // A synthetic delete from an existence filter or a limbo
                // resolution: forget the document entirely.
                txn.state.remote_documents.remove(&mut txn.writes, key);
                txn.state.indexes.remove_document(key);
                changed = changed.insert(key.clone(), doc.clone());
            } else if !existing.is_valid_document()
                || doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
            {
                let mut doc = doc.clone();
                doc.set_read_time(remote_version);
                txn.state.indexes.update_index_entries([&doc], remote_version);
                txn.state.remote_documents.add(&mut txn.writes, doc.clone())?;
                changed = changed.insert(key.clone(), doc);
            } else {
                trace!(
                    key = %key,
                    cached = %existing.version(),
                    update = %doc.version(),
                    "ignoring outdated watch update"
                );
            }
        }

        if remote_version != SnapshotVersion::NONE {
            let last = txn.state.targets.last_remote_snapshot_version();
            if remote_version < last {
                return Err(CoreError::fatal(format!(
                    "watch stream reverted to {remote_version} after {last}"
                )));
            }
            txn.state
                .targets
                .set_last_remote_snapshot_version(&mut txn.writes, remote_version)?;
        }

        // Pending transforms resolve against the new remote base.
        let pending: DocumentKeySet = changed
            .keys()
            .filter(|key| txn.state.mutation_queue.contains_key(key))
            .cloned()
            .collect();
        if !pending.is_empty() {
            txn.recalculate_and_save_overlays(&pending)?;
        }

        let overlayed = txn.local_view().get_overlayed_documents(&changed);
        let result = overlayed
            .into_iter()
            .fold(DocumentMap::new(), |map, (key, doc)| map.insert(key, doc.document));
        self.commit(txn)?;
        for data in updated_targets {
            self.target_data_by_target.insert(data.target_id, data);
        }
        Ok(result)
    }

    fn should_persist_target_data(&self, old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
        if old.resume_token.is_empty() {
            return true;
        }
        // A fresh token is always worth keeping. The age rule only covers
        // version advances that carry no token.
        if !change.resume_token.is_empty() && change.resume_token != old.resume_token {
            return true;
        }
        let max_age = i64::try_from(self.config.resume_token_max_age.as_micros()).unwrap_or(i64::MAX);
        let elapsed = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
        if elapsed >= max_age {
            return true;
        }
        change.document_change_count() > 0
    }

    /// Runs `query` against the local cache.
    ///
    /// With `use_previous_results`, the target's last known result set may
    /// seed the answer.
    ///
    /// # Errors
    ///
    /// Returns an error if an index created along the way cannot be
    /// persisted.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> CoreResult<QueryResult> {
        let mut txn = self.persistence.begin("execute_query");
        let target_data = self.get_target_data(&query.to_target());
        let (limbo_free, remote_keys) = match &target_data {
            Some(data) => (
                data.last_limbo_free_snapshot_version,
                txn.state.targets.get_matching_keys_for_target_id(data.target_id),
            ),
            None => (SnapshotVersion::NONE, DocumentKeySet::new()),
        };
        let (documents, strategy) = if use_previous_results {
            self.query_engine
                .get_documents_matching_query(&mut txn, query, limbo_free, &remote_keys)?
        } else {
            self.query_engine.get_documents_matching_query(
                &mut txn,
                query,
                SnapshotVersion::NONE,
                &DocumentKeySet::new(),
            )?
        };
        self.commit(txn)?;
        Ok(QueryResult {
            documents,
            remote_keys,
            strategy,
        })
    }

    /// Assigns a target id to `target`, reusing the existing one if the
    /// target is already known.
    ///
    /// # Errors
    ///
    /// Returns an error if the new target cannot be persisted.
    pub fn allocate_target(&mut self, target: Target) -> CoreResult<TargetData> {
        if let Some(data) = self.cached_target_data(&target) {
            return Ok(data.clone());
        }
        let mut txn = self.persistence.begin("allocate_target");
        let data = match txn.state.targets.get_target_data(&target).cloned() {
            Some(data) => data,
            None => {
                let target_id = self.target_id_generator.next_id();
                let sequence_number = txn.state.targets.next_sequence_number(&mut txn.writes)?;
                let data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                txn.state.targets.add_target_data(&mut txn.writes, data.clone())?;
                data
            }
        };
        self.commit(txn)?;
        debug!(target_id = data.target_id, "allocated target");
        self.target_id_by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        self.target_data_by_target.insert(data.target_id, data.clone());
        Ok(data)
    }

    fn cached_target_data(&self, target: &Target) -> Option<&TargetData> {
        let id = self.target_id_by_canonical_id.get(&target.canonical_id())?;
        self.target_data_by_target
            .get(id)
            .filter(|data| data.target == *target)
    }

    /// Returns what is known about `target`, active or persisted.
    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.cached_target_data(target)
            .or_else(|| self.persistence.state().targets.get_target_data(target))
            .cloned()
    }

    /// Returns the active target with `target_id`.
    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    /// Stops tracking an active target. Unless `keep_persisted`, its
    /// metadata and matching keys are deleted and unreferenced documents
    /// are evicted.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the target is not active.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted: bool) -> CoreResult<()> {
        let data = self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| CoreError::fatal(format!("released unknown target {target_id}")))?;
        let mut txn = self.persistence.begin("release_target");
        if !keep_persisted {
            for key in txn.state.targets.remove_target_data(&mut txn.writes, &data) {
                txn.mark_orphaned(key);
            }
        }
        for key in self.local_view_references.remove_references_for_id(target_id) {
            txn.mark_orphaned(key);
        }
        self.commit(txn)?;
        self.target_data_by_target.remove(&target_id);
        self.target_id_by_canonical_id.remove(&data.target.canonical_id());
        debug!(target_id, keep_persisted, "released target");
        Ok(())
    }

    /// Returns the keys the backend last reported for `target_id`.
    pub fn get_remote_document_keys(&self, target_id: TargetId) -> DocumentKeySet {
        self.persistence
            .state()
            .targets
            .get_matching_keys_for_target_id(target_id)
    }

    /// Returns the local view of one document.
    pub fn read_document(&self, key: &DocumentKey) -> MutableDocument {
        let txn = self.persistence.begin("read_document");
        txn.local_view().get_document(key)
    }

    /// Returns the newest queued batch id, or the unknown id.
    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.persistence
            .state()
            .mutation_queue
            .highest_unacknowledged_batch_id()
    }

    /// Returns the first queued batch after `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> Option<MutationBatch> {
        self.persistence
            .state()
            .mutation_queue
            .next_mutation_batch_after(after_batch_id)
            .cloned()
    }

    /// Returns the number of queued batches.
    pub fn pending_batch_count(&self) -> usize {
        self.persistence.state().mutation_queue.len()
    }

    /// Returns the write stream token.
    pub fn get_last_stream_token(&self) -> Bytes {
        self.persistence
            .state()
            .mutation_queue
            .last_stream_token()
            .clone()
    }

    /// Persists the write stream token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be persisted.
    pub fn set_last_stream_token(&mut self, token: Bytes) -> CoreResult<()> {
        let mut txn = self.persistence.begin("set_last_stream_token");
        txn.state
            .mutation_queue
            .set_last_stream_token(&mut txn.writes, token)?;
        self.commit(txn)
    }

    /// Pins the documents views display and records limbo-free snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if evicting released documents fails.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) -> CoreResult<()> {
        let mut txn = self.persistence.begin("notify_local_view_changes");
        for change in changes {
            self.local_view_references
                .add_references(change.added_keys.iter(), change.target_id);
            self.local_view_references
                .remove_references(change.removed_keys.iter(), change.target_id);
            for key in change.removed_keys.iter() {
                txn.mark_orphaned(key.clone());
            }
            if !change.from_cache {
                if let Some(data) = self.target_data_by_target.get_mut(&change.target_id) {
                    let version = data.snapshot_version;
                    *data = data.with_last_limbo_free_snapshot_version(version);
                }
            }
        }
        self.commit(txn)
    }

    /// Enables or disables automatic index creation.
    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Returns every field index.
    pub fn field_indexes(&self) -> Vec<FieldIndex> {
        self.persistence.state().indexes.field_indexes()
    }

    /// Deletes every field index.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be persisted.
    pub fn delete_all_field_indexes(&mut self) -> CoreResult<()> {
        let mut txn = self.persistence.begin("delete_all_field_indexes");
        txn.state.indexes.delete_all_field_indexes(&mut txn.writes);
        self.commit(txn)?;
        info!("deleted all field indexes");
        Ok(())
    }

    /// Returns the version of the last applied remote event.
    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence.state().targets.last_remote_snapshot_version()
    }

    /// Returns the number of cached remote documents.
    pub fn cached_document_count(&self) -> usize {
        self.persistence.state().remote_documents.len()
    }
}
