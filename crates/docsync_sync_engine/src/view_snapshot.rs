//! Snapshots raised to query listeners.

use crate::document_set::DocumentSet;
use crate::error::{SyncError, SyncResult};
use docsync_core::{DocumentKey, DocumentKeySet, MutableDocument, Query};
use std::collections::BTreeMap;

/// How a document changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The document entered the result set.
    Added,
    /// The document left the result set.
    Removed,
    /// The document's data changed.
    Modified,
    /// Only the document's pending-write state changed.
    Metadata,
}

impl ChangeType {
    /// Order in which changes are listed: removals, then additions, then
    /// modifications.
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

/// One document's change.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentViewChange {
    /// What happened.
    pub kind: ChangeType,
    /// The document after the change, or before it for removals.
    pub doc: MutableDocument,
}

/// Collapses successive changes of the same document into one.
#[derive(Debug, Clone, Default)]
pub(crate) struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `change` on top of any earlier change of the same document.
    pub(crate) fn track(&mut self, change: DocumentViewChange) -> SyncResult<()> {
        use ChangeType::*;
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };
        let merged = match (old.kind, change.kind) {
            (Metadata, new) if new != Added => Some(change),
            (old_kind, Metadata) if old_kind != Removed => Some(DocumentViewChange {
                kind: old_kind,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                kind: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                kind: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                kind: Modified,
                doc: change.doc,
            }),
            (old_kind, new_kind) => {
                return Err(SyncError::Fatal(format!(
                    "unsupported change {new_kind:?} after {old_kind:?} for {key}"
                )))
            }
        };
        match merged {
            Some(change) => self.changes.insert(key, change),
            None => self.changes.remove(&key),
        };
        Ok(())
    }

    pub(crate) fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Sorts changes for delivery: by kind, then in query order.
pub(crate) fn sort_changes(changes: &mut [DocumentViewChange], query: &Query) {
    use docsync_core::Comparator;
    let comparator = query.comparator();
    changes.sort_by(|a, b| {
        a.kind
            .rank()
            .cmp(&b.kind.rank())
            .then_with(|| comparator.compare(&a.doc, &b.doc))
    });
}

/// The result set of a query at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    /// The query.
    pub query: Query,
    /// Current results in query order.
    pub docs: DocumentSet,
    /// Results of the previous snapshot.
    pub old_docs: DocumentSet,
    /// Changes from `old_docs` to `docs`.
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents with local writes not yet acknowledged.
    pub mutated_keys: DocumentKeySet,
    /// Whether the results may not match the backend.
    pub from_cache: bool,
    /// Whether `from_cache` flipped since the previous snapshot.
    pub sync_state_changed: bool,
    /// Whether metadata-only changes were filtered out.
    pub excludes_metadata_changes: bool,
    /// Whether the query was synced with the backend before, so an empty
    /// cached result is meaningful.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot listing every document as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|doc| DocumentViewChange {
                kind: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        Self {
            old_docs: DocumentSet::empty_like(&docs),
            query,
            docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    /// Returns true if any document has unacknowledged local writes.
    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Returns the documents in query order.
    pub fn documents(&self) -> impl Iterator<Item = &MutableDocument> + '_ {
        self.docs.iter()
    }

    /// Returns the number of documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Returns true if no document matches.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{ObjectValue, SnapshotVersion, Value};

    fn doc(path: &str, n: i64) -> MutableDocument {
        MutableDocument::new_found(
            DocumentKey::parse(path).unwrap(),
            SnapshotVersion::from_micros(n),
            ObjectValue::from_pairs([("n", Value::Integer(n))]),
        )
    }

    fn change(kind: ChangeType, doc: MutableDocument) -> DocumentViewChange {
        DocumentViewChange { kind, doc }
    }

    fn collapse(steps: &[(ChangeType, i64)]) -> Vec<(ChangeType, i64)> {
        let mut set = DocumentChangeSet::new();
        for (kind, n) in steps {
            set.track(change(*kind, doc("rooms/a", *n))).unwrap();
        }
        set.into_changes()
            .into_iter()
            .map(|c| (c.kind, c.doc.version().to_micros()))
            .collect()
    }

    #[test]
    fn successive_changes_collapse() {
        use ChangeType::*;
        assert_eq!(collapse(&[(Added, 1), (Modified, 2)]), [(Added, 2)]);
        assert!(collapse(&[(Added, 1), (Removed, 1)]).is_empty());
        assert_eq!(collapse(&[(Modified, 1), (Removed, 2)]), [(Removed, 1)]);
        assert_eq!(collapse(&[(Removed, 1), (Added, 2)]), [(Modified, 2)]);
        assert_eq!(collapse(&[(Metadata, 1), (Modified, 2)]), [(Modified, 2)]);
        assert_eq!(collapse(&[(Modified, 1), (Metadata, 2)]), [(Modified, 2)]);
    }

    #[test]
    fn impossible_sequences_are_rejected() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("rooms/a", 1))).unwrap();
        assert!(set.track(change(ChangeType::Added, doc("rooms/a", 2))).is_err());
    }

    #[test]
    fn removals_sort_first() {
        let query = Query::collection("rooms").unwrap();
        let mut changes = vec![
            change(ChangeType::Modified, doc("rooms/a", 1)),
            change(ChangeType::Added, doc("rooms/c", 1)),
            change(ChangeType::Removed, doc("rooms/d", 1)),
            change(ChangeType::Added, doc("rooms/b", 1)),
        ];
        sort_changes(&mut changes, &query);
        let order: Vec<_> = changes.iter().map(|c| c.doc.key().document_id().to_string()).collect();
        assert_eq!(order, ["d", "b", "c", "a"]);
    }

    #[test]
    fn initial_snapshot_lists_every_document_as_added() {
        let query = Query::collection("rooms").unwrap();
        let docs = DocumentSet::for_query(&query).add(doc("rooms/a", 1)).add(doc("rooms/b", 1));
        let snapshot = ViewSnapshot::from_initial_documents(query, docs, DocumentKeySet::new(), true, false);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot.doc_changes.iter().all(|c| c.kind == ChangeType::Added));
        assert!(snapshot.old_docs.is_empty());
        assert!(!snapshot.has_pending_writes());
    }
}
