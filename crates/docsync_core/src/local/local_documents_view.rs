//! The local view of documents: remote state with pending writes applied.

use super::persistence::{LocalState, Transaction};
use crate::error::CoreResult;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MutableDocument, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::mutation::{calculate_overlay_mutation, OverlayedDocument};
use crate::query::Query;
use docsync_codec::Timestamp;
use std::collections::{BTreeMap, BTreeSet};

/// Read access to documents as the user sees them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalDocumentsView<'a> {
    state: &'a LocalState,
}

impl<'a> LocalDocumentsView<'a> {
    pub(crate) fn new(state: &'a LocalState) -> Self {
        Self { state }
    }

    fn apply_overlay(&self, doc: &mut MutableDocument) -> Option<FieldMask> {
        match self.state.overlays.get_overlay(doc.key()) {
            Some(overlay) => {
                overlay
                    .mutation
                    .apply_to_local_view(doc, Some(FieldMask::empty()), Timestamp::now())
            }
            None => Some(FieldMask::empty()),
        }
    }

    /// Returns the local view of one document. Unknown documents come back
    /// invalid.
    pub(crate) fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut doc = self.state.remote_documents.get(key);
        self.apply_overlay(&mut doc);
        doc
    }

    /// Returns the local view of each of `keys`.
    pub(crate) fn get_documents(&self, keys: &DocumentKeySet) -> DocumentMap {
        keys.iter().fold(DocumentMap::new(), |map, key| {
            map.insert(key.clone(), self.get_document(key))
        })
    }

    /// Applies saved overlays to `docs` and reports the fields they touched.
    pub(crate) fn get_overlayed_documents(
        &self,
        docs: &DocumentMap,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        docs.iter()
            .map(|(key, doc)| {
                let mut doc = doc.clone();
                let mask = self.apply_overlay(&mut doc);
                (key.clone(), OverlayedDocument::new(doc, mask))
            })
            .collect()
    }

    /// Runs `query` against the cache, looking only at remote documents read
    /// after `since_read_time` plus every document with pending writes.
    ///
    /// Returns the matches and the number of remote documents scanned.
    pub(crate) fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> (DocumentMap, usize) {
        if query.is_document_query() {
            let mut result = DocumentMap::new();
            if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
                let doc = self.get_document(&key);
                if doc.is_found_document() {
                    result = result.insert(key, doc);
                }
            }
            return (result, 1);
        }

        let collection = query.path();
        let (mut candidates, scanned) = self
            .state
            .remote_documents
            .get_documents_matching_collection(collection, since_read_time);
        let overlays = self
            .state
            .overlays
            .get_overlays_for_collection(collection, BATCH_ID_UNKNOWN);
        for key in overlays.keys() {
            if !candidates.contains_key(key) {
                candidates = candidates.insert(key.clone(), self.state.remote_documents.get(key));
            }
        }

        let mut result = DocumentMap::new();
        for (key, doc) in candidates.iter() {
            let mut doc = doc.clone();
            if let Some(overlay) = overlays.get(key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&doc) {
                result = result.insert(key.clone(), doc);
            }
        }
        (result, scanned)
    }
}

impl Transaction {
    pub(crate) fn local_view(&self) -> LocalDocumentsView<'_> {
        LocalDocumentsView::new(&self.state)
    }

    /// Recomputes the overlay of each of `keys` from the mutation queue and
    /// saves it, replacing whatever overlay was stored before.
    pub(crate) fn recalculate_and_save_overlays(&mut self, keys: &DocumentKeySet) -> CoreResult<()> {
        let mut docs: BTreeMap<DocumentKey, MutableDocument> = keys
            .iter()
            .map(|key| (key.clone(), self.state.remote_documents.get(key)))
            .collect();
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();

        for batch in self.state.mutation_queue.all_mutation_batches_affecting_keys(keys) {
            for key in batch.keys().iter() {
                let Some(doc) = docs.get_mut(key) else {
                    continue;
                };
                let mask = masks.remove(key).unwrap_or(Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(doc, mask));
                keys_by_batch
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key.clone());
            }
        }

        // Each key's overlay is attributed to the newest batch touching it.
        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in keys_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(doc), Some(mask)) = (docs.get(key), masks.get(key)) else {
                    continue;
                };
                match calculate_overlay_mutation(doc, mask.as_ref()) {
                    Some(mutation) => {
                        overlays.insert(key.clone(), mutation);
                    }
                    None => self.state.overlays.remove_overlay(&mut self.writes, key),
                }
            }
            self.state
                .overlays
                .save_overlays(&mut self.writes, *batch_id, &overlays)?;
        }

        for key in keys.iter() {
            if !processed.contains(key) {
                self.state.overlays.remove_overlay(&mut self.writes, key);
            }
        }
        Ok(())
    }
}
