//! The client-side result set of one query.
//!
//! A [`View`] turns document changes from the local store into
//! [`ViewSnapshot`]s. Computing the changes and applying them are separate
//! steps so a limited query that lost documents past its limit can be
//! refilled from the local store in between.

use crate::document_set::DocumentSet;
use crate::error::SyncResult;
use crate::online_state::OnlineState;
use crate::view_snapshot::{sort_changes, ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use docsync_core::{Comparator, DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, LimitType, MutableDocument, Query, TargetChange};
use std::cmp::Ordering;

/// Whether a view reflects the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncState {
    /// Results may differ from the backend.
    Local,
    /// Results match the backend.
    Synced,
}

/// A limbo document entering or leaving a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Output of [`View::compute_doc_changes`], input to
/// [`View::apply_changes`].
#[derive(Debug, Clone)]
pub(crate) struct ViewDocumentChanges {
    pub(crate) document_set: DocumentSet,
    pub(crate) change_set: DocumentChangeSet,
    /// The limit dropped documents that may be replaced by ones not in the
    /// changes; the caller should recompute from the full result.
    pub(crate) needs_refill: bool,
    pub(crate) mutated_keys: DocumentKeySet,
}

/// Output of [`View::apply_changes`].
#[derive(Debug, Default)]
pub(crate) struct ViewChange {
    pub(crate) snapshot: Option<ViewSnapshot>,
    pub(crate) limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Debug, Clone)]
pub(crate) struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// Whether the backend marked the target current.
    current: bool,
    document_set: DocumentSet,
    /// Documents shown that the backend has not confirmed as matching.
    limbo_documents: DocumentKeySet,
    /// Keys the backend says match the query.
    synced_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub(crate) fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        Self {
            comparator: query.comparator(),
            document_set: DocumentSet::for_query(&query),
            query,
            sync_state: None,
            current: false,
            limbo_documents: DocumentKeySet::new(),
            synced_documents,
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    pub(crate) fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub(crate) fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Computes how `doc_changes` alter the view, on top of `previous` if
    /// given, without changing the view.
    pub(crate) fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> SyncResult<ViewDocumentChanges> {
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(p) => (p.change_set, p.document_set, p.mutated_keys),
            None => (DocumentChangeSet::new(), self.document_set.clone(), self.mutated_keys.clone()),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|l| l as usize);
        let at_limit = limit.is_some_and(|l| old_document_set.len() == l);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|d| self.mutated_keys.contains(d.key()));
            let new_has_pending = new_doc.is_some_and(|d| {
                d.has_local_mutations() || (self.mutated_keys.contains(d.key()) && d.has_committed_mutations())
            });

            let mut applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                kind: ChangeType::Modified,
                                doc: new.clone(),
                            })?;
                            applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.comparator.compare(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.comparator.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                // The document moved past the limit edge; an
                                // unseen document may belong in its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            kind: ChangeType::Metadata,
                            doc: new.clone(),
                        })?;
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        kind: ChangeType::Added,
                        doc: new.clone(),
                    })?;
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        kind: ChangeType::Removed,
                        doc: old.clone(),
                    })?;
                    applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        new_document_set = new_document_set.add(new.clone());
                        new_mutated_keys = if new_has_pending {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last(),
                    LimitType::Last => new_document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else { break };
                new_document_set = new_document_set.delete(evicted.key());
                new_mutated_keys = new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    kind: ChangeType::Removed,
                    doc: evicted,
                })?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        })
    }

    /// Applies computed changes and, if anything visible changed, returns a
    /// snapshot.
    ///
    /// `target_change` updates the synced keys and the current flag.
    /// `target_is_pending_reset` suppresses limbo tracking while the
    /// target is being re-listened after an existence filter mismatch.
    pub(crate) fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;
        let mut changes = doc_changes.change_set.into_changes();
        sort_changes(&mut changes, &self.query);

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: self.document_set.clone(),
            old_docs,
            doc_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|c| !c.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Marks the view as not current when the client goes offline, so
    /// listeners see `from_cache`.
    pub(crate) fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Returns a snapshot listing the current results as added.
    pub(crate) fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let limbo = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .fold(DocumentKeySet::new(), |set, doc| set.insert(doc.key().clone()));
        self.limbo_documents = limbo;

        let removed = old_limbo
            .iter()
            .filter(|key| !self.limbo_documents.contains(key))
            .map(|key| LimboDocumentChange::Removed(key.clone()));
        let added = self
            .limbo_documents
            .iter()
            .filter(|key| !old_limbo.contains(key))
            .map(|key| LimboDocumentChange::Added(key.clone()));
        removed.chain(added).collect()
    }

    /// A shown document is in limbo if the backend does not list it and no
    /// local write explains its presence.
    fn should_be_in_limbo(&self, doc: &MutableDocument) -> bool {
        !self.synced_documents.contains(doc.key()) && !doc.has_local_mutations()
    }
}

/// A document with acknowledged but unsynced writes replacing one with
/// pending writes would flicker back to the old value.
fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{field_filter, FieldPath, ObjectValue, Operator, OrderBy, SnapshotVersion, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn doc(path: &str, score: i64) -> MutableDocument {
        MutableDocument::new_found(
            key(path),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_pairs([("score", Value::Integer(score))]),
        )
    }

    fn docs(items: &[MutableDocument]) -> DocumentMap {
        items
            .iter()
            .fold(DocumentMap::new(), |map, d| map.insert(d.key().clone(), d.clone()))
    }

    fn apply(view: &mut View, items: &[MutableDocument], change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&docs(items), None).unwrap();
        view.apply_changes(changes, true, change, false)
    }

    fn current_with(keys: &[&str]) -> TargetChange {
        let mut change = TargetChange::current_with_token(bytes::Bytes::from_static(b"t"));
        for k in keys {
            change.added_documents = change.added_documents.insert(key(k));
        }
        change
    }

    fn scores(snapshot: &ViewSnapshot) -> Vec<i64> {
        snapshot
            .documents()
            .map(|d| match d.field(&FieldPath::parse("score").unwrap()) {
                Some(Value::Integer(n)) => *n,
                _ => -1,
            })
            .collect()
    }

    #[test]
    fn first_snapshot_is_from_cache() {
        let mut view = View::new(Query::collection("rooms").unwrap(), DocumentKeySet::new());
        let change = apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert_eq!(snapshot.doc_changes.len(), 2);
    }

    #[test]
    fn current_target_makes_view_synced() {
        let mut view = View::new(Query::collection("rooms").unwrap(), DocumentKeySet::new());
        apply(&mut view, &[doc("rooms/a", 1)], None);
        let change = apply(&mut view, &[], Some(&current_with(&["rooms/a"])));
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(change.limbo_changes.is_empty());
    }

    #[test]
    fn non_matching_documents_are_ignored() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(field_filter("score", Operator::GreaterThan, Value::Integer(5)).unwrap());
        let mut view = View::new(query, DocumentKeySet::new());
        let snapshot = apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 9)], None).snapshot.unwrap();
        assert_eq!(snapshot.len(), 1);

        // Falling out of the filter removes the document.
        let snapshot = apply(&mut view, &[doc("rooms/b", 2)], None).snapshot.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.doc_changes[0].kind, ChangeType::Removed);
    }

    #[test]
    fn limit_keeps_top_documents_and_requests_refill() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::desc(FieldPath::parse("score").unwrap()))
            .with_limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::new());
        let snapshot = apply(&mut view, &[doc("rooms/a", 9), doc("rooms/b", 7)], None).snapshot.unwrap();
        assert_eq!(scores(&snapshot), [9, 7]);

        let snapshot = apply(&mut view, &[doc("rooms/c", 8)], None).snapshot.unwrap();
        assert_eq!(scores(&snapshot), [9, 8]);
        let kinds: Vec<_> = snapshot.doc_changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, [ChangeType::Removed, ChangeType::Added]);

        // Dropping a document from a full view needs the local store to
        // supply the next one.
        let mut deleted = doc("rooms/a", 9);
        deleted.convert_to_no_document(SnapshotVersion::from_micros(2));
        let changes = view.compute_doc_changes(&docs(&[deleted]), None).unwrap();
        assert!(changes.needs_refill);
    }

    #[test]
    fn unsynced_documents_of_current_view_are_limbo() {
        let mut view = View::new(Query::collection("rooms").unwrap(), DocumentKeySet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);
        let change = apply(&mut view, &[], Some(&current_with(&["rooms/a"])));
        assert_eq!(change.limbo_changes, [LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.is_none());
        assert!(view.limbo_documents().contains(&key("rooms/b")));

        // The backend confirming the document ends limbo.
        let change = apply(&mut view, &[], Some(&current_with(&["rooms/b"])));
        assert_eq!(change.limbo_changes, [LimboDocumentChange::Removed(key("rooms/b"))]);
        assert!(!change.snapshot.unwrap().from_cache);
    }

    #[test]
    fn local_writes_are_not_limbo() {
        let mut view = View::new(Query::collection("rooms").unwrap(), DocumentKeySet::new());
        let mut pending = doc("rooms/a", 1);
        pending.set_has_local_mutations();
        apply(&mut view, &[pending], None);
        let change = apply(&mut view, &[], Some(&current_with(&[])));
        assert!(change.limbo_changes.is_empty());
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.has_pending_writes());
        assert!(!snapshot.from_cache);
    }

    #[test]
    fn going_offline_marks_current_view_from_cache() {
        let mut view = View::new(Query::collection("rooms").unwrap(), DocumentKeySet::new());
        apply(&mut view, &[], Some(&current_with(&[])));
        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
