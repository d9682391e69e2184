//! Saved overlays, one per document with pending writes.

use super::schema::{self, OVERLAY_PREFIX};
use crate::collections::SortedMap;
use crate::error::CoreResult;
use crate::model::{BatchId, DocumentKey, DocumentKeySet, ResourcePath};
use crate::mutation::{Mutation, Overlay};
use docsync_storage::{KvStore, WriteBatch};
use std::collections::BTreeMap;

/// Overlays keyed by document, with a secondary index by the largest batch
/// id folded into each overlay.
#[derive(Debug, Clone, Default)]
pub struct OverlayCache {
    overlays: SortedMap<DocumentKey, Overlay>,
    by_batch: SortedMap<BatchId, DocumentKeySet>,
}

impl OverlayCache {
    pub(crate) fn load(store: &dyn KvStore) -> CoreResult<Self> {
        let mut cache = Self::default();
        for (key, value) in store.scan_prefix(OVERLAY_PREFIX.as_bytes())? {
            let overlay: Overlay = schema::decode(&key, &value)?;
            cache.index(overlay);
        }
        Ok(cache)
    }

    fn index(&mut self, overlay: Overlay) {
        let key = overlay.key().clone();
        let batch_keys = self
            .by_batch
            .get(&overlay.largest_batch_id)
            .cloned()
            .unwrap_or_default()
            .insert(key.clone());
        self.by_batch = self.by_batch.insert(overlay.largest_batch_id, batch_keys);
        self.overlays = self.overlays.insert(key, overlay);
    }

    fn unindex(&mut self, key: &DocumentKey) {
        let Some(existing) = self.overlays.get(key) else {
            return;
        };
        let batch_id = existing.largest_batch_id;
        let remaining = self
            .by_batch
            .get(&batch_id)
            .map(|keys| keys.remove(key))
            .unwrap_or_default();
        self.by_batch = if remaining.is_empty() {
            self.by_batch.remove(&batch_id)
        } else {
            self.by_batch.insert(batch_id, remaining)
        };
        self.overlays = self.overlays.remove(key);
    }

    /// Returns the overlay for `key`.
    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    /// Returns the overlays for the given keys that exist.
    pub fn get_overlays<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.into_iter()
            .filter_map(|key| self.overlays.get(key).map(|o| (key.clone(), o.clone())))
            .collect()
    }

    /// Saves one overlay per entry of `overlays`, all attributed to
    /// `largest_batch_id`.
    pub fn save_overlays(
        &mut self,
        writes: &mut WriteBatch,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> CoreResult<()> {
        for (key, mutation) in overlays {
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            writes.put(schema::overlay_key(key), schema::encode(&overlay)?);
            self.unindex(key);
            self.index(overlay);
        }
        Ok(())
    }

    /// Removes the overlay for `key`.
    pub fn remove_overlay(&mut self, writes: &mut WriteBatch, key: &DocumentKey) {
        if self.overlays.contains_key(key) {
            writes.delete(schema::overlay_key(key));
            self.unindex(key);
        }
    }

    /// Removes the overlays of `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &mut self,
        writes: &mut WriteBatch,
        keys: &DocumentKeySet,
        batch_id: BatchId,
    ) {
        for key in keys {
            if self.overlays.get(key).map(|o| o.largest_batch_id) == Some(batch_id) {
                self.remove_overlay(writes, key);
            }
        }
    }

    /// Returns the overlays of documents directly inside `collection` whose
    /// largest batch id is greater than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = DocumentKey::scan_start(collection);
        self.overlays
            .iter_from(&start)
            .take_while(|(k, _)| collection.is_prefix_of(k.path()))
            .filter(|(k, o)| k.has_collection(collection) && o.largest_batch_id > since_batch_id)
            .map(|(k, o)| (k.clone(), o.clone()))
            .collect()
    }

    /// Returns the number of saved overlays.
    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    /// Returns the keys whose overlay was last written by `batch_id`.
    pub fn keys_for_batch(&self, batch_id: BatchId) -> DocumentKeySet {
        self.by_batch.get(&batch_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BATCH_ID_UNKNOWN;
    use docsync_storage::MemoryKvStore;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn overlays(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths.iter().map(|p| (key(p), Mutation::delete(key(p)))).collect()
    }

    #[test]
    fn saving_moves_overlay_between_batches() {
        let mut cache = OverlayCache::default();
        let mut writes = WriteBatch::new();
        cache.save_overlays(&mut writes, 1, &overlays(&["rooms/a", "rooms/b"])).unwrap();
        cache.save_overlays(&mut writes, 2, &overlays(&["rooms/a"])).unwrap();

        assert_eq!(cache.keys_for_batch(1).len(), 1);
        assert_eq!(cache.keys_for_batch(2).len(), 1);
        assert_eq!(cache.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);
    }

    #[test]
    fn remove_for_batch_keeps_newer_overlays() {
        let mut cache = OverlayCache::default();
        let mut writes = WriteBatch::new();
        cache.save_overlays(&mut writes, 1, &overlays(&["rooms/a", "rooms/b"])).unwrap();
        cache.save_overlays(&mut writes, 2, &overlays(&["rooms/a"])).unwrap();

        let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        cache.remove_overlays_for_batch_id(&mut writes, &keys, 1);
        assert!(cache.get_overlay(&key("rooms/b")).is_none());
        assert!(cache.get_overlay(&key("rooms/a")).is_some());
        assert!(cache.keys_for_batch(1).is_empty());
    }

    #[test]
    fn collection_lookup_filters_by_batch() {
        let mut cache = OverlayCache::default();
        let mut writes = WriteBatch::new();
        cache.save_overlays(&mut writes, 1, &overlays(&["rooms/a"])).unwrap();
        cache.save_overlays(&mut writes, 3, &overlays(&["rooms/b", "rooms/b/msgs/1"])).unwrap();

        let rooms = ResourcePath::parse("rooms").unwrap();
        assert_eq!(cache.get_overlays_for_collection(&rooms, BATCH_ID_UNKNOWN).len(), 2);
        assert_eq!(cache.get_overlays_for_collection(&rooms, 1).len(), 1);
    }

    #[test]
    fn overlays_survive_reload() {
        let store = MemoryKvStore::new();
        let mut cache = OverlayCache::default();
        let mut writes = WriteBatch::new();
        cache.save_overlays(&mut writes, 4, &overlays(&["rooms/a", "rooms/b"])).unwrap();
        cache.remove_overlay(&mut writes, &key("rooms/b"));
        store.commit(writes).unwrap();

        let loaded = OverlayCache::load(&store).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.keys_for_batch(4).len(), 1);
    }
}
