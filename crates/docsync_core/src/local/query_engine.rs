//! Chooses the cheapest way to answer a query from the local cache.

use super::persistence::Transaction;
use crate::collections::SortedSet;
use crate::config::QueryEngineConfig;
use crate::error::CoreResult;
use crate::model::{DocumentKeySet, DocumentMap, MutableDocument, SnapshotVersion, BATCH_ID_UNKNOWN};
use crate::query::{DocumentComparator, LimitType, Query};
use tracing::{debug, trace};

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// A field index narrowed the candidates.
    Index,
    /// The previous result set plus documents changed since it was
    /// computed.
    PreviousResults,
    /// Every document of the collection was examined.
    FullScan,
}

/// Local query planner.
///
/// Tries an index first, then the previous results of the target, and
/// falls back to a full collection scan. Full scans that read many more
/// documents than they return can create an index for next time.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    config: QueryEngineConfig,
}

impl QueryEngine {
    /// Creates an engine with the given configuration.
    pub fn new(config: QueryEngineConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &QueryEngineConfig {
        &self.config
    }

    /// Enables or disables index auto-creation.
    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.config.index_auto_creation_enabled = enabled;
    }

    pub(crate) fn get_documents_matching_query(
        &self,
        txn: &mut Transaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> CoreResult<(DocumentMap, QueryStrategy)> {
        if let Some(docs) = self.perform_query_using_index(txn, query) {
            return Ok((docs, QueryStrategy::Index));
        }
        if let Some(docs) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok((docs, QueryStrategy::PreviousResults));
        }

        let (docs, read) = txn
            .local_view()
            .get_documents_matching_query(query, SnapshotVersion::NONE);
        trace!(query = %query.canonical_id(), read, matched = docs.len(), "full collection scan");
        if self.config.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, read, docs.len())?;
        }
        Ok((docs, QueryStrategy::FullScan))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut Transaction,
        query: &Query,
        documents_read: usize,
        result_size: usize,
    ) -> CoreResult<()> {
        if documents_read < self.config.min_collection_size {
            return Ok(());
        }
        let cost = self.config.relative_index_read_cost();
        #[allow(clippy::cast_precision_loss)]
        let worthwhile = documents_read as f64 > cost * result_size as f64;
        if !worthwhile {
            return Ok(());
        }
        let target = query.to_target();
        let state = &mut txn.state;
        let created =
            state
                .indexes
                .create_target_indexes(&mut txn.writes, &target, &state.remote_documents)?;
        if created.is_some() {
            debug!(
                query = %query.canonical_id(),
                documents_read,
                result_size,
                "auto-created index after costly scan"
            );
        }
        Ok(())
    }

    fn perform_query_using_index(&self, txn: &Transaction, query: &Query) -> Option<DocumentMap> {
        if query.matches_all_documents() || query.is_document_query() {
            return None;
        }
        let target = query.to_target();
        let indexes = &txn.state.indexes;
        let index = indexes.get_field_index(&target)?;
        if !indexes.is_caught_up(index, &txn.state.remote_documents) {
            return None;
        }
        let keys: DocumentKeySet = indexes.get_documents_matching_target(&target)?.into_iter().collect();
        let view = txn.local_view();

        let mut result = DocumentMap::new();
        for (key, doc) in view.get_documents(&keys).iter() {
            if query.matches(doc) {
                result = result.insert(key.clone(), doc.clone());
            }
        }
        // Pending writes are not indexed; check them directly.
        for key in txn
            .state
            .overlays
            .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN)
            .keys()
        {
            let doc = view.get_document(key);
            result = if query.matches(&doc) {
                result.insert(key.clone(), doc)
            } else {
                result.remove(key)
            };
        }
        Some(result)
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &Transaction,
        query: &Query,
        remote_keys: &DocumentKeySet,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_none() {
            return None;
        }
        let view = txn.local_view();
        let previous = apply_query(query, &view.get_documents(remote_keys));
        if query.limit().is_some()
            && needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        let (mut result, _) = view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for doc in previous.iter() {
            result = result.insert(doc.key().clone(), doc.clone());
        }
        Some(result)
    }
}

fn apply_query(query: &Query, docs: &DocumentMap) -> SortedSet<MutableDocument, DocumentComparator> {
    let mut result = SortedSet::with_comparator(query.comparator());
    for doc in docs.values() {
        if query.matches(doc) {
            result = result.insert(doc.clone());
        }
    }
    result
}

/// Decides whether the previous results of a limited query might be stale.
///
/// A limited result set can only be reused if it is still full and the
/// document at its edge has not changed since the last limbo-free
/// snapshot; otherwise a document outside the old results could now belong
/// in them.
fn needs_refill(
    query: &Query,
    sorted_previous: &SortedSet<MutableDocument, DocumentComparator>,
    remote_keys: &DocumentKeySet,
    limbo_free_version: SnapshotVersion,
) -> bool {
    if query.limit().is_none() {
        return false;
    }
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match edge {
        None => false,
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_version,
    }
}
