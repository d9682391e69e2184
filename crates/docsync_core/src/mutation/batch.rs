//! Mutation batches.

use super::overlay::OverlayedDocument;
use super::write::{calculate_overlay_mutation, Mutation, MutationResult};
use crate::error::{CoreError, CoreResult};
use crate::model::{BatchId, DocumentKey, DocumentKeySet, FieldMask, MutableDocument, SnapshotVersion};
use bytes::Bytes;
use docsync_codec::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An atomic group of mutations queued for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Strictly increasing id assigned at enqueue time.
    pub batch_id: BatchId,
    /// Local time of the write, used for pending server timestamps.
    pub local_write_time: Timestamp,
    /// The user's mutations.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Creates a batch.
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    /// Applies the acknowledged batch to the cached remote copy of `doc`.
    ///
    /// # Errors
    ///
    /// Propagates fatal errors from malformed results.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> CoreResult<()> {
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == doc.key() {
                mutation.apply_to_remote_document(doc, mutation_result)?;
            }
        }
        Ok(())
    }

    /// Applies every mutation of the batch that targets `doc` to its local
    /// view and returns the updated mask.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        let mut mask = mask;
        for mutation in &self.mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the batch to a set of overlaid documents and returns the
    /// overlay mutation for each touched key.
    ///
    /// Keys in `without_remote_version` have never been seen by the backend,
    /// so their overlay always replaces the whole document.
    pub fn apply_to_local_document_set(
        &self,
        docs: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys().iter() {
            let Some(overlayed) = docs.get_mut(key) else {
                continue;
            };
            let mask = overlayed.mutated_fields.take();
            let mut mask = self.apply_to_local_view(&mut overlayed.document, mask);
            if without_remote_version.contains(key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mask;
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::NONE);
            }
        }
        overlays
    }

    /// Returns the keys the batch writes.
    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    /// Returns true if the batch has no mutations.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// The backend's acknowledgement of a batch.
#[derive(Debug, Clone)]
pub struct MutationBatchResult {
    /// The acknowledged batch.
    pub batch: MutationBatch,
    /// Commit time of the batch.
    pub commit_version: SnapshotVersion,
    /// One result per mutation, in order.
    pub mutation_results: Vec<MutationResult>,
    /// Write stream token to persist with the acknowledgement.
    pub stream_token: Bytes,
    /// Version of each written document after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    /// Pairs a batch with the backend's results.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the number of results does not match the
    /// number of mutations.
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> CoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(CoreError::fatal(format!(
                "batch {} has {} mutations but {} results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(m, r)| (m.key().clone(), r.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    /// Returns the keys whose mutations carried transform results.
    pub fn keys_with_transform_results(&self) -> DocumentKeySet {
        self.batch
            .mutations
            .iter()
            .zip(&self.mutation_results)
            .filter(|(_, r)| !r.transform_results.is_empty())
            .map(|(m, _)| m.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, ObjectValue};
    use docsync_codec::Value;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::MIN, vec![Mutation::delete(key("users/1"))]);
        let err = MutationBatchResult::new(batch, SnapshotVersion::NONE, vec![], Bytes::new());
        assert!(err.unwrap_err().is_fatal());
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let set = Mutation::set(key("users/1"), ObjectValue::from_pairs([("name", Value::from("Ann"))]));
        let batch = MutationBatch::new(1, Timestamp::MIN, vec![set]);
        let mut docs = BTreeMap::new();
        docs.insert(
            key("users/1"),
            OverlayedDocument::new(MutableDocument::new_invalid(key("users/1")), Some(FieldMask::empty())),
        );
        let without_remote: DocumentKeySet = [key("users/1")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut docs, &without_remote);

        let doc = &docs[&key("users/1")].document;
        assert!(doc.has_local_mutations());
        assert_eq!(
            doc.field(&FieldPath::parse("name").unwrap()),
            Some(&Value::from("Ann"))
        );
        assert!(overlays.contains_key(&key("users/1")));
    }

    #[test]
    fn batch_keys_are_deduplicated() {
        let batch = MutationBatch::new(
            1,
            Timestamp::MIN,
            vec![Mutation::delete(key("a/1")), Mutation::delete(key("a/1")), Mutation::delete(key("a/2"))],
        );
        assert_eq!(batch.keys().len(), 2);
    }
}
