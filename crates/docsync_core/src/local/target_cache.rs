//! Persisted targets and their matching documents.

use super::reference_set::ReferenceSet;
use super::schema::{self, TARGET_DOC_PREFIX, TARGET_GLOBALS, TARGET_PREFIX};
use super::target_data::TargetData;
use crate::collections::SortedMap;
use crate::error::CoreResult;
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::query::Target;
use docsync_storage::{KvStore, WriteBatch};
use serde::{Deserialize, Serialize};

/// Hands out target ids from one of two disjoint sequences.
///
/// Targets allocated by the local store use even ids; limbo resolution
/// targets allocated by the sync engine use odd ids. The two never collide.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for local store targets, continuing after `after`.
    pub fn for_target_cache(after: TargetId) -> Self {
        Self::seeded(0, after)
    }

    /// Generator for sync engine limbo targets.
    pub fn for_sync_engine() -> Self {
        Self::seeded(1, 0)
    }

    fn seeded(generator_id: TargetId, after: TargetId) -> Self {
        let mut next_id = after.max(0) + 1;
        if next_id % 2 != generator_id {
            next_id += 1;
        }
        Self { next_id }
    }

    /// Returns the next id.
    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

/// Counters persisted with the target cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetGlobals {
    /// Highest target id ever allocated.
    pub highest_target_id: TargetId,
    /// Highest listen sequence number handed out.
    pub highest_listen_sequence_number: ListenSequenceNumber,
    /// Version of the last remote event applied.
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// Targets known to the local store plus the document keys each target
/// currently matches on the backend.
#[derive(Debug, Clone, Default)]
pub struct TargetCache {
    targets: SortedMap<TargetId, TargetData>,
    by_canonical_id: SortedMap<String, TargetId>,
    references: ReferenceSet,
    globals: TargetGlobals,
}

impl TargetCache {
    pub(crate) fn load(store: &dyn KvStore) -> CoreResult<Self> {
        let mut cache = Self::default();
        if let Some(raw) = store.get(TARGET_GLOBALS.as_bytes())? {
            cache.globals = schema::decode(TARGET_GLOBALS.as_bytes(), &raw)?;
        }
        for (key, value) in store.scan_prefix(TARGET_PREFIX.as_bytes())? {
            let data: TargetData = schema::decode(&key, &value)?;
            cache.index(data);
        }
        for (key, _) in store.scan_prefix(TARGET_DOC_PREFIX.as_bytes())? {
            let (target_id, doc_key) = schema::parse_target_doc_key(&key)?;
            cache.references.add_reference(doc_key, target_id);
        }
        Ok(cache)
    }

    fn index(&mut self, data: TargetData) {
        self.by_canonical_id = self
            .by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        self.targets = self.targets.insert(data.target_id, data);
    }

    fn save(&mut self, writes: &mut WriteBatch, data: TargetData) -> CoreResult<()> {
        writes.put(schema::target_key(data.target_id), schema::encode(&data)?);
        self.index(data);
        Ok(())
    }

    fn save_globals(&self, writes: &mut WriteBatch) -> CoreResult<()> {
        writes.put(TARGET_GLOBALS.as_bytes().to_vec(), schema::encode(&self.globals)?);
        Ok(())
    }

    /// Stores a newly allocated target.
    pub fn add_target_data(&mut self, writes: &mut WriteBatch, data: TargetData) -> CoreResult<()> {
        let mut globals_changed = false;
        if data.target_id > self.globals.highest_target_id {
            self.globals.highest_target_id = data.target_id;
            globals_changed = true;
        }
        if data.sequence_number > self.globals.highest_listen_sequence_number {
            self.globals.highest_listen_sequence_number = data.sequence_number;
            globals_changed = true;
        }
        self.save(writes, data)?;
        if globals_changed {
            self.save_globals(writes)?;
        }
        Ok(())
    }

    /// Replaces the metadata of an existing target.
    pub fn update_target_data(&mut self, writes: &mut WriteBatch, data: TargetData) -> CoreResult<()> {
        self.save(writes, data)
    }

    /// Removes a target and its matching keys. Returns the keys the target
    /// referenced.
    pub fn remove_target_data(&mut self, writes: &mut WriteBatch, data: &TargetData) -> Vec<DocumentKey> {
        writes.delete(schema::target_key(data.target_id));
        if self.by_canonical_id.get(&data.target.canonical_id()) == Some(&data.target_id) {
            self.by_canonical_id = self.by_canonical_id.remove(&data.target.canonical_id());
        }
        self.targets = self.targets.remove(&data.target_id);
        self.remove_matching_keys_for_target_id(writes, data.target_id)
    }

    /// Returns the metadata of a target equal to `target`.
    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        let id = self.by_canonical_id.get(&target.canonical_id())?;
        self.targets.get(id).filter(|data| data.target == *target)
    }

    /// Returns the metadata of the target with `target_id`.
    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    /// Returns the number of persisted targets.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Records that `keys` match `target_id`.
    pub fn add_matching_keys<'a>(
        &mut self,
        writes: &mut WriteBatch,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            writes.put(schema::target_doc_key(target_id, key), Vec::new());
            self.references.add_reference(key.clone(), target_id);
        }
    }

    /// Records that `keys` no longer match `target_id`.
    pub fn remove_matching_keys<'a>(
        &mut self,
        writes: &mut WriteBatch,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            writes.delete(schema::target_doc_key(target_id, key));
            self.references.remove_reference(key, target_id);
        }
    }

    /// Drops every matching key of `target_id` and returns them.
    pub fn remove_matching_keys_for_target_id(
        &mut self,
        writes: &mut WriteBatch,
        target_id: TargetId,
    ) -> Vec<DocumentKey> {
        writes.delete_prefix(schema::target_doc_prefix(target_id));
        self.references.remove_references_for_id(target_id)
    }

    /// Returns the keys matching `target_id`.
    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    /// Returns true if any target matches `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    /// Returns the highest target id ever allocated.
    pub fn highest_target_id(&self) -> TargetId {
        self.globals.highest_target_id
    }

    /// Returns the highest listen sequence number handed out.
    pub fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.globals.highest_listen_sequence_number
    }

    /// Allocates the next listen sequence number.
    pub fn next_sequence_number(&mut self, writes: &mut WriteBatch) -> CoreResult<ListenSequenceNumber> {
        self.globals.highest_listen_sequence_number += 1;
        self.save_globals(writes)?;
        Ok(self.globals.highest_listen_sequence_number)
    }

    /// Returns the version of the last applied remote event.
    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.globals.last_remote_snapshot_version
    }

    /// Records the version of the last applied remote event.
    pub fn set_last_remote_snapshot_version(
        &mut self,
        writes: &mut WriteBatch,
        version: SnapshotVersion,
    ) -> CoreResult<()> {
        self.globals.last_remote_snapshot_version = version;
        self.save_globals(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::TargetPurpose;
    use crate::query::Query;
    use docsync_storage::MemoryKvStore;

    fn target(path: &str) -> Target {
        Query::collection(path).unwrap().to_target()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn generators_never_collide() {
        let mut cache_ids = TargetIdGenerator::for_target_cache(0);
        let mut engine_ids = TargetIdGenerator::for_sync_engine();
        let even: Vec<_> = (0..3).map(|_| cache_ids.next_id()).collect();
        let odd: Vec<_> = (0..3).map(|_| engine_ids.next_id()).collect();
        assert_eq!(even, [2, 4, 6]);
        assert_eq!(odd, [1, 3, 5]);
        assert_eq!(TargetIdGenerator::for_target_cache(6).next_id(), 8);
        assert_eq!(TargetIdGenerator::for_target_cache(7).next_id(), 8);
    }

    #[test]
    fn lookup_by_target_and_id() {
        let mut cache = TargetCache::default();
        let mut writes = WriteBatch::new();
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
        cache.add_target_data(&mut writes, data.clone()).unwrap();

        assert_eq!(cache.get_target_data(&target("rooms")), Some(&data));
        assert_eq!(cache.get_target_data_by_id(2), Some(&data));
        assert!(cache.get_target_data(&target("users")).is_none());
        assert_eq!(cache.highest_target_id(), 2);
        assert_eq!(cache.highest_listen_sequence_number(), 1);
    }

    #[test]
    fn removing_a_target_drops_its_keys() {
        let mut cache = TargetCache::default();
        let mut writes = WriteBatch::new();
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
        cache.add_target_data(&mut writes, data.clone()).unwrap();
        cache.add_matching_keys(&mut writes, [key("rooms/a"), key("rooms/b")].iter(), 2);
        cache.remove_matching_keys(&mut writes, [key("rooms/b")].iter(), 2);
        assert_eq!(cache.get_matching_keys_for_target_id(2).len(), 1);

        let removed = cache.remove_target_data(&mut writes, &data);
        assert_eq!(removed, vec![key("rooms/a")]);
        assert!(!cache.contains_key(&key("rooms/a")));
        assert_eq!(cache.target_count(), 0);
    }

    #[test]
    fn reload_restores_targets_keys_and_globals() {
        let store = MemoryKvStore::new();
        let mut cache = TargetCache::default();
        let mut writes = WriteBatch::new();
        cache
            .add_target_data(&mut writes, TargetData::new(target("rooms"), 4, TargetPurpose::Listen, 3))
            .unwrap();
        cache.add_matching_keys(&mut writes, [key("rooms/a")].iter(), 4);
        cache
            .set_last_remote_snapshot_version(&mut writes, SnapshotVersion::from_micros(9))
            .unwrap();
        store.commit(writes).unwrap();

        let loaded = TargetCache::load(&store).unwrap();
        assert_eq!(loaded.highest_target_id(), 4);
        assert_eq!(loaded.last_remote_snapshot_version(), SnapshotVersion::from_micros(9));
        assert!(loaded.contains_key(&key("rooms/a")));
        assert!(loaded.get_target_data(&target("rooms")).is_some());
    }
}
