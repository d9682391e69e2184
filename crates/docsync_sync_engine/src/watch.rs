//! Accumulates listen stream changes into consistent remote events.
//!
//! Watch changes arrive one at a time and are only consistent at a global
//! snapshot marker. The [`WatchChangeAggregator`] buffers them per target,
//! tracks outstanding add/remove requests so changes for targets the
//! client no longer listens to are dropped, reconciles existence filters,
//! and produces a [`RemoteEvent`] at each marker.

use crate::view_snapshot::ChangeType;
use bytes::Bytes;
use docsync_core::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, RemoteEvent, SnapshotVersion, TargetChange,
    TargetData, TargetId, TargetPurpose,
};
use docsync_sync_protocol::{
    BloomFilter, DocumentChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// What the aggregator needs to know about the client's targets.
pub(crate) trait TargetMetadataProvider {
    /// Keys the client believes currently match the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Metadata of an active target, or `None` if it is not listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Buffered state of one target between snapshots.
#[derive(Debug, Clone)]
struct TargetState {
    pending_responses: i32,
    current: bool,
    resume_token: Bytes,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Bytes::new(),
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    /// Waiting for the backend to confirm an add or remove.
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &Bytes) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, kind) in &self.document_changes {
            match kind {
                ChangeType::Added => change.added_documents = change.added_documents.insert(key.clone()),
                ChangeType::Modified => {
                    change.modified_documents = change.modified_documents.insert(key.clone())
                }
                ChangeType::Removed => change.removed_documents = change.removed_documents.insert(key.clone()),
                ChangeType::Metadata => {}
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Outcome of testing an existence filter's bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BloomFilterOutcome {
    /// The removed documents were identified.
    Success,
    /// No usable bloom filter was sent.
    Skipped,
    /// The filter kept too many documents.
    FalsePositive,
}

/// Turns a sequence of watch changes into [`RemoteEvent`]s.
#[derive(Debug, Default)]
pub(crate) struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle_document_change(&mut self, change: DocumentChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc) if doc.is_found_document() => self.add_document_to_target(*target_id, doc, metadata),
                other => self.remove_document_from_target(*target_id, &change.key, other.clone(), metadata),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone(), metadata);
        }
    }

    pub(crate) fn handle_target_change(&mut self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A re-added target starts from a clean slate.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Targets a change applies to: its own list, or every active target.
    fn affected_targets(&self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|id| self.is_active_target(*id, metadata))
            .collect()
    }

    /// Compares the backend's count with the local one and, on mismatch,
    /// either drops the documents the bloom filter proves removed or
    /// schedules a full re-listen.
    pub(crate) fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_query() {
            if expected_count == 0 {
                // The single document was deleted while the client was not
                // watching.
                let key = match DocumentKey::from_path(target_data.target.path.clone()) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(target_id, error = %e, "document target without document path");
                        return;
                    }
                };
                let tombstone = MutableDocument::new_no_document(key.clone(), SnapshotVersion::NONE);
                self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
            } else if expected_count != 1 {
                warn!(target_id, expected_count, "document target reported more than one match");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == i64::from(expected_count) {
            return;
        }
        let outcome = self.apply_bloom_filter(change, current_count, metadata);
        if outcome != BloomFilterOutcome::Success {
            debug!(target_id, expected_count, current_count, ?outcome, "existence filter mismatch, resetting target");
            self.reset_target(target_id, metadata);
            let purpose = if outcome == BloomFilterOutcome::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: i64,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterOutcome {
        let Some(params) = &change.filter.unchanged_names else {
            return BloomFilterOutcome::Skipped;
        };
        let filter = match BloomFilter::try_from(params.clone()) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(error = %e, "ignoring malformed bloom filter");
                return BloomFilterOutcome::Skipped;
            }
        };
        if filter.bit_count() == 0 {
            return BloomFilterOutcome::Skipped;
        }
        let removed = self.filter_removed_documents(&filter, change.target_id, metadata);
        if i64::from(change.filter.count) != current_count - removed {
            return BloomFilterOutcome::FalsePositive;
        }
        BloomFilterOutcome::Success
    }

    /// Removes every locally matching document the filter rules out.
    fn filter_removed_documents(
        &mut self,
        filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id).iter() {
            if !filter.might_contain_key(key) {
                self.remove_document_from_target(target_id, key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Consumes the buffered changes into an event at `snapshot_version`.
    pub(crate) fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self.target_states.get(&target_id).is_some_and(|s| s.current);
            if current && target_data.target.is_document_query() {
                // A current single-document target that never mentioned its
                // document proves the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated && !self.target_contains_document(target_id, &key, metadata) {
                        let tombstone = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates)
            .iter()
            .fold(DocumentMap::new(), |map, (key, doc)| {
                let mut doc = doc.clone();
                doc.set_read_time(snapshot_version);
                map.insert(key.clone(), doc)
            });

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        };
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();
        event
    }

    fn add_document_to_target(&mut self, target_id: TargetId, doc: &MutableDocument, metadata: &dyn TargetMetadataProvider) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let kind = if self.target_contains_document(target_id, doc.key(), metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id).add_document_change(doc.key().clone(), kind);
        self.pending_document_updates = self.pending_document_updates.insert(doc.key().clone(), doc.clone());
        self.pending_document_updates_by_target
            .entry(doc.key().clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(doc.key().clone())
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added and removed within one snapshot.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .remove(&target_id);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated {
            self.pending_document_updates = self.pending_document_updates.insert(key.clone(), doc);
        }
    }

    /// Forgets a target the backend confirmed removed.
    pub(crate) fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Counts an add or remove request awaiting the backend's answer.
    pub(crate) fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    /// Drops all buffered changes of a target and marks every document it
    /// matched as removed, so the next snapshot starts from scratch.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.remote_keys_for_target(target_id).iter() {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey, metadata: &dyn TargetMetadataProvider) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    /// Metadata of a target that is listened to and not awaiting an add or
    /// remove confirmation.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            return None;
        }
        metadata.target_data_for_target(target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{ObjectValue, Query, Value};
    use docsync_sync_protocol::ExistenceFilter;

    #[derive(Default)]
    struct Targets {
        data: BTreeMap<TargetId, TargetData>,
        keys: BTreeMap<TargetId, DocumentKeySet>,
    }

    impl Targets {
        fn listen(&mut self, target_id: TargetId, path: &str) {
            let target = Query::collection(path).unwrap().to_target();
            self.data
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
        }

        fn listen_limbo(&mut self, target_id: TargetId, path: &str) {
            let target = Query::document(&key(path)).to_target();
            self.data
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1));
        }

        fn set_keys(&mut self, target_id: TargetId, paths: &[&str]) {
            let keys = paths.iter().fold(DocumentKeySet::new(), |set, p| set.insert(key(p)));
            self.keys.insert(target_id, keys);
        }
    }

    impl TargetMetadataProvider for Targets {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.data.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found(
            key(path),
            SnapshotVersion::from_micros(version),
            ObjectValue::from_pairs([("v", Value::Integer(version))]),
        )
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    #[test]
    fn changes_for_pending_targets_are_dropped() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(DocumentChange::updated(doc("rooms/a", 1), vec![2]), &targets);
        let event = aggregator.create_remote_event(version(1), &targets);
        assert!(event.document_updates.is_empty());

        let added = WatchTargetChange::new(WatchTargetChangeState::Added, vec![2]);
        aggregator.handle_target_change(&added, &targets);
        aggregator.handle_document_change(DocumentChange::updated(doc("rooms/a", 2), vec![2]), &targets);
        let event = aggregator.create_remote_event(version(2), &targets);
        assert_eq!(event.document_updates.len(), 1);
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn current_and_resume_token_are_reported() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        let mut aggregator = WatchChangeAggregator::new();

        let current = WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
            .with_resume_token(Bytes::from_static(b"r1"));
        aggregator.handle_target_change(&current, &targets);
        let event = aggregator.create_remote_event(version(3), &targets);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, Bytes::from_static(b"r1"));
    }

    #[test]
    fn known_documents_are_modified_not_added() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.set_keys(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();

        aggregator.handle_document_change(DocumentChange::updated(doc("rooms/a", 4), vec![2]), &targets);
        aggregator.handle_document_change(DocumentChange::deleted(key("rooms/b"), version(4), vec![2]), &targets);
        let event = aggregator.create_remote_event(version(4), &targets);
        let change = &event.target_changes[&2];
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
        assert!(event.document_updates.get(&key("rooms/b")).unwrap().is_no_document());
    }

    #[test]
    fn count_mismatch_without_bloom_filter_resets_target() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.set_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();

        let filter = ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter::with_count(1),
        };
        aggregator.handle_existence_filter(&filter, &targets);
        let event = aggregator.create_remote_event(version(5), &targets);
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_identifies_removed_documents() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.set_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new();

        let kept = [key("rooms/a"), key("rooms/c")];
        let bloom = BloomFilter::from_keys(&kept, 4096, 8).unwrap();
        assert!(!bloom.might_contain_key(&key("rooms/b")));
        let filter = ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter {
                count: 2,
                unchanged_names: Some(bloom.to_params()),
            },
        };
        aggregator.handle_existence_filter(&filter, &targets);
        let event = aggregator.create_remote_event(version(6), &targets);
        assert!(event.target_mismatches.is_empty());
        let removed: Vec<_> = event.target_changes[&2].removed_documents.iter().cloned().collect();
        assert_eq!(removed, vec![key("rooms/b")]);
    }

    #[test]
    fn saturated_bloom_filter_is_a_false_positive() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.set_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();

        let filter = ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(
                    BloomFilter::new(Bytes::from_static(&[0xff; 8]), 0, 4).unwrap().to_params(),
                ),
            },
        };
        aggregator.handle_existence_filter(&filter, &targets);
        let event = aggregator.create_remote_event(version(7), &targets);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
        // Both documents pass the filter, so neither is deleted from the
        // cache. The re-listen decides which one is gone.
        assert!(event.document_updates.is_empty());
        let change = &event.target_changes[&2];
        assert!(change.resume_token.is_empty());
        assert!(!change.current);
        assert!(change.removed_documents.contains(&key("rooms/a")));
        assert!(change.removed_documents.contains(&key("rooms/b")));
    }

    #[test]
    fn bloom_false_positive_keeps_the_unmatched_document_cached() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.set_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new();

        // Only a remains on the backend, but the filter also reports b.
        let bloom = BloomFilter::from_keys([&key("rooms/a"), &key("rooms/b")], 4096, 8).unwrap();
        assert!(!bloom.might_contain_key(&key("rooms/c")));
        let filter = ExistenceFilterChange {
            target_id: 2,
            filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(bloom.to_params()),
            },
        };
        aggregator.handle_existence_filter(&filter, &targets);
        let event = aggregator.create_remote_event(version(7), &targets);

        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
        assert!(!event.document_updates.contains_key(&key("rooms/b")));
        assert!(!event.document_updates.contains_key(&key("rooms/a")));
        let change = &event.target_changes[&2];
        assert!(change.resume_token.is_empty());
        assert!(!change.current);
    }

    #[test]
    fn current_limbo_target_without_document_proves_deletion() {
        let mut targets = Targets::default();
        targets.listen_limbo(1, "rooms/ghost");
        let mut aggregator = WatchChangeAggregator::new();

        let current = WatchTargetChange::new(WatchTargetChangeState::Current, vec![1]);
        aggregator.handle_target_change(&current, &targets);
        let event = aggregator.create_remote_event(version(8), &targets);
        let ghost = event.document_updates.get(&key("rooms/ghost")).unwrap();
        assert!(ghost.is_no_document());
        assert_eq!(ghost.version(), version(8));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/ghost")));
    }

    #[test]
    fn documents_seen_by_query_targets_are_not_limbo_only() {
        let mut targets = Targets::default();
        targets.listen(2, "rooms");
        targets.listen_limbo(1, "rooms/a");
        let mut aggregator = WatchChangeAggregator::new();

        aggregator.handle_document_change(DocumentChange::updated(doc("rooms/a", 9), vec![1, 2]), &targets);
        let event = aggregator.create_remote_event(version(9), &targets);
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
