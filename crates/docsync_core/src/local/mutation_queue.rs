//! Queue of locally written, unacknowledged mutation batches.

use super::schema::{self, HIGHEST_ACKED_BATCH_ID, MUTATION_PREFIX, STREAM_TOKEN};
use crate::collections::{SortedMap, SortedSet};
use crate::error::{CoreError, CoreResult};
use crate::model::{BatchId, DocumentKey, DocumentKeySet, BATCH_ID_UNKNOWN};
use crate::mutation::{Mutation, MutationBatch};
use crate::query::Query;
use bytes::Bytes;
use docsync_codec::Timestamp;
use docsync_storage::{KvStore, WriteBatch};
use tracing::debug;

/// FIFO queue of mutation batches awaiting acknowledgement.
///
/// Batch ids increase strictly and are never reused, not even across
/// restarts: the highest acknowledged id is persisted alongside the queue.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    batches: SortedMap<BatchId, MutationBatch>,
    by_key: SortedSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    highest_acknowledged_batch_id: BatchId,
    last_stream_token: Bytes,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            batches: SortedMap::new(),
            by_key: SortedSet::new(),
            next_batch_id: 1,
            highest_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Bytes::new(),
        }
    }
}

impl MutationQueue {
    pub(crate) fn load(store: &dyn KvStore) -> CoreResult<Self> {
        let mut queue = Self::default();
        if let Some(raw) = store.get(HIGHEST_ACKED_BATCH_ID.as_bytes())? {
            queue.highest_acknowledged_batch_id =
                schema::decode(HIGHEST_ACKED_BATCH_ID.as_bytes(), &raw)?;
        }
        if let Some(raw) = store.get(STREAM_TOKEN.as_bytes())? {
            queue.last_stream_token = schema::decode(STREAM_TOKEN.as_bytes(), &raw)?;
        }
        for (key, value) in store.scan_prefix(MUTATION_PREFIX.as_bytes())? {
            let batch: MutationBatch = schema::decode(&key, &value)?;
            queue.index_batch(batch);
        }
        queue.next_batch_id = queue
            .batches
            .max_key()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
            .max(queue.highest_acknowledged_batch_id)
            .max(0)
            + 1;
        Ok(queue)
    }

    fn index_batch(&mut self, batch: MutationBatch) {
        for mutation in &batch.mutations {
            self.by_key = self.by_key.insert((mutation.key().clone(), batch.batch_id));
        }
        self.batches = self.batches.insert(batch.batch_id, batch);
    }

    /// Returns true if no batches are queued.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Returns the number of queued batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Appends a new batch and returns it.
    pub fn add_mutation_batch(
        &mut self,
        writes: &mut WriteBatch,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> CoreResult<MutationBatch> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        writes.put(schema::mutation_key(batch_id), schema::encode(&batch)?);
        self.index_batch(batch.clone());
        debug!(batch_id, "queued mutation batch");
        Ok(batch)
    }

    /// Returns the batch with `batch_id`, if still queued.
    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// Returns the first batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .iter_from(&batch_id.saturating_add(1))
            .next()
            .map(|(_, batch)| batch)
    }

    /// Returns the id of the newest queued batch, or [`BATCH_ID_UNKNOWN`].
    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches.max_key().copied().unwrap_or(BATCH_ID_UNKNOWN)
    }

    /// Returns every queued batch in order.
    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    fn batch_ids_for_key<'a>(&'a self, key: &'a DocumentKey) -> impl Iterator<Item = BatchId> + 'a {
        self.by_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .take_while(move |(k, _)| k == key)
            .map(|(_, id)| *id)
    }

    /// Returns true if any queued batch writes `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    /// Returns the batches writing `key`, in order.
    pub fn all_mutation_batches_affecting_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batches_by_id(self.batch_ids_for_key(key))
    }

    /// Returns the batches writing any of `keys`, in order and without
    /// duplicates.
    pub fn all_mutation_batches_affecting_keys(&self, keys: &DocumentKeySet) -> Vec<MutationBatch> {
        self.batches_by_id(keys.iter().flat_map(|key| self.batch_ids_for_key(key)))
    }

    /// Returns the batches writing a document the query could match.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        if query.is_document_query() {
            return match DocumentKey::from_path(query.path().clone()) {
                Ok(key) => self.all_mutation_batches_affecting_key(&key),
                Err(_) => Vec::new(),
            };
        }
        let collection = query.path();
        let start = (DocumentKey::scan_start(collection), BatchId::MIN);
        let ids = self
            .by_key
            .iter_from(&start)
            .take_while(|(k, _)| collection.is_prefix_of(k.path()))
            .filter(|(k, _)| k.has_collection(collection))
            .map(|(_, id)| *id);
        self.batches_by_id(ids)
    }

    fn batches_by_id(&self, ids: impl Iterator<Item = BatchId>) -> Vec<MutationBatch> {
        let ids: SortedSet<BatchId> = ids.collect();
        ids.iter()
            .filter_map(|id| self.batches.get(id).cloned())
            .collect()
    }

    /// Removes the oldest batch after its acknowledgement or rejection.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if `batch` is not the head of the queue.
    pub fn remove_mutation_batch(
        &mut self,
        writes: &mut WriteBatch,
        batch: &MutationBatch,
    ) -> CoreResult<()> {
        let head = self.batches.min_key().copied();
        if head != Some(batch.batch_id) {
            return Err(CoreError::fatal(format!(
                "can only remove the first queued batch (head {head:?}, got {})",
                batch.batch_id
            )));
        }
        writes.delete(schema::mutation_key(batch.batch_id));
        for mutation in &batch.mutations {
            self.by_key = self.by_key.remove(&(mutation.key().clone(), batch.batch_id));
        }
        self.batches = self.batches.remove(&batch.batch_id);
        self.highest_acknowledged_batch_id = self.highest_acknowledged_batch_id.max(batch.batch_id);
        writes.put(
            HIGHEST_ACKED_BATCH_ID.as_bytes().to_vec(),
            schema::encode(&self.highest_acknowledged_batch_id)?,
        );
        Ok(())
    }

    /// Returns the token of the last write stream response.
    pub fn last_stream_token(&self) -> &Bytes {
        &self.last_stream_token
    }

    /// Persists the write stream token.
    pub fn set_last_stream_token(&mut self, writes: &mut WriteBatch, token: Bytes) -> CoreResult<()> {
        writes.put(STREAM_TOKEN.as_bytes().to_vec(), schema::encode(&token)?);
        self.last_stream_token = token;
        Ok(())
    }

    /// Verifies that an empty queue has no stray key references.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the key index still has entries.
    pub fn check_empty(&self) -> CoreResult<()> {
        if self.batches.is_empty() && !self.by_key.is_empty() {
            return Err(CoreError::fatal(format!(
                "mutation queue is empty but {} key references remain",
                self.by_key.len()
            )));
        }
        Ok(())
    }
}
