//! Client-side field indexes.
//!
//! Index definitions are persisted; index entries are kept in memory and
//! rebuilt from the remote document cache when the store opens.

use super::remote_document_cache::RemoteDocumentCache;
use super::schema::{self, INDEX_PREFIX};
use crate::collections::{Comparator, SortedMap, SortedSet};
use crate::error::CoreResult;
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath, SnapshotVersion};
use crate::query::Target;
use docsync_codec::Value;
use docsync_storage::{KvStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::info;

/// An index over some fields of a collection's documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldIndex {
    /// Local identifier.
    pub index_id: i32,
    /// The indexed collection.
    pub collection: ResourcePath,
    /// Indexed fields, in index order.
    pub fields: Vec<FieldPath>,
    /// Read time up to which the entries reflect the remote cache.
    pub offset: SnapshotVersion,
}

impl FieldIndex {
    fn storage_key(&self) -> Vec<u8> {
        let fields: Vec<String> = self.fields.iter().map(FieldPath::canonical_string).collect();
        schema::index_key(&self.collection.canonical_string(), &fields.join(","))
    }

    fn serves(&self, target: &Target) -> bool {
        self.collection == target.path && self.fields == target.index_fields()
    }

    fn entry_for(&self, doc: &MutableDocument) -> Option<IndexEntry> {
        if !doc.is_found_document() || !doc.key().has_collection(&self.collection) {
            return None;
        }
        let values = self
            .fields
            .iter()
            .map(|field| doc.field(field).cloned())
            .collect::<Option<Vec<Value>>>()?;
        Some(IndexEntry {
            values,
            key: doc.key().clone(),
        })
    }
}

/// One row of an index: the indexed values of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    values: Vec<Value>,
    key: DocumentKey,
}

/// Orders entries by their values, then by document key.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntryComparator;

impl Comparator<IndexEntry> for IndexEntryComparator {
    fn compare(&self, a: &IndexEntry, b: &IndexEntry) -> Ordering {
        for (x, y) in a.values.iter().zip(&b.values) {
            let ordering = x.compare(y);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.values
            .len()
            .cmp(&b.values.len())
            .then_with(|| a.key.cmp(&b.key))
    }
}

type Entries = SortedSet<IndexEntry, IndexEntryComparator>;

/// Field index definitions plus their entries.
#[derive(Debug, Clone)]
pub struct IndexManager {
    indexes: SortedMap<i32, FieldIndex>,
    entries: SortedMap<i32, Entries>,
    entry_by_doc: SortedMap<(i32, DocumentKey), IndexEntry>,
    next_index_id: i32,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self {
            indexes: SortedMap::new(),
            entries: SortedMap::new(),
            entry_by_doc: SortedMap::new(),
            next_index_id: 1,
        }
    }
}

impl IndexManager {
    pub(crate) fn load(store: &dyn KvStore, remote: &RemoteDocumentCache) -> CoreResult<Self> {
        let mut manager = Self::default();
        for (key, value) in store.scan_prefix(INDEX_PREFIX.as_bytes())? {
            let index: FieldIndex = schema::decode(&key, &value)?;
            manager.next_index_id = manager.next_index_id.max(index.index_id + 1);
            manager.backfill(index, remote);
        }
        Ok(manager)
    }

    fn backfill(&mut self, mut index: FieldIndex, remote: &RemoteDocumentCache) {
        let mut entries = Entries::with_comparator(IndexEntryComparator);
        for doc in remote.collection_documents(&index.collection) {
            if let Some(entry) = index.entry_for(doc) {
                self.entry_by_doc = self
                    .entry_by_doc
                    .insert((index.index_id, entry.key.clone()), entry.clone());
                entries = entries.insert(entry);
            }
        }
        index.offset = remote.latest_read_time();
        self.entries = self.entries.insert(index.index_id, entries);
        self.indexes = self.indexes.insert(index.index_id, index);
    }

    /// Returns every index definition.
    pub fn field_indexes(&self) -> Vec<FieldIndex> {
        self.indexes.values().cloned().collect()
    }

    /// Returns the index that serves `target`, if any.
    pub fn get_field_index(&self, target: &Target) -> Option<&FieldIndex> {
        self.indexes.values().find(|index| index.serves(target))
    }

    /// Creates an index serving `target` and backfills it. Returns `None` if
    /// such an index already exists or the target needs no index.
    pub fn create_target_indexes(
        &mut self,
        writes: &mut WriteBatch,
        target: &Target,
        remote: &RemoteDocumentCache,
    ) -> CoreResult<Option<FieldIndex>> {
        let fields = target.index_fields();
        if fields.is_empty() || target.is_document_query() || self.get_field_index(target).is_some() {
            return Ok(None);
        }
        let index = FieldIndex {
            index_id: self.next_index_id,
            collection: target.path.clone(),
            fields,
            offset: SnapshotVersion::NONE,
        };
        self.next_index_id += 1;
        writes.put(index.storage_key(), schema::encode(&index)?);
        self.backfill(index.clone(), remote);
        info!(collection = %index.collection, fields = index.fields.len(), "created field index");
        Ok(self.indexes.get(&index.index_id).cloned())
    }

    /// Returns true if `index` reflects every document in the cache.
    pub fn is_caught_up(&self, index: &FieldIndex, remote: &RemoteDocumentCache) -> bool {
        index.offset >= remote.latest_read_time()
    }

    /// Returns the keys whose indexed values equal the target's equality
    /// constraints, or `None` if no index serves the target.
    ///
    /// Only the equality prefix narrows the scan; callers filter the
    /// returned documents with the full query.
    pub fn get_documents_matching_target(&self, target: &Target) -> Option<Vec<DocumentKey>> {
        let index = self.get_field_index(target)?;
        let entries = self.entries.get(&index.index_id)?;
        let mut prefix = Vec::new();
        for field in &index.fields {
            let equality = target
                .filters
                .iter()
                .find(|f| f.is_equality() && f.field == *field);
            match equality {
                Some(filter) => prefix.push(filter.value.clone()),
                None => break,
            }
        }
        let start = IndexEntry {
            values: prefix.clone(),
            key: DocumentKey::min(),
        };
        let keys = entries
            .iter_from(&start)
            .take_while(|entry| {
                entry.values.len() >= prefix.len()
                    && entry
                        .values
                        .iter()
                        .zip(&prefix)
                        .all(|(a, b)| a.compare(b) == Ordering::Equal)
            })
            .map(|entry| entry.key.clone())
            .collect();
        Some(keys)
    }

    /// Reindexes `docs`, which were written to the remote cache at
    /// `read_time`.
    pub fn update_index_entries<'a>(
        &mut self,
        docs: impl IntoIterator<Item = &'a MutableDocument>,
        read_time: SnapshotVersion,
    ) {
        if self.indexes.is_empty() {
            return;
        }
        let indexes = self.field_indexes();
        for doc in docs {
            for index in &indexes {
                self.update_entry(index, doc);
            }
        }
        for mut index in indexes {
            index.offset = index.offset.max(read_time);
            self.indexes = self.indexes.insert(index.index_id, index);
        }
    }

    /// Drops the entry of a document that left the remote cache.
    pub fn remove_document(&mut self, key: &DocumentKey) {
        for index in self.field_indexes() {
            self.remove_entry(index.index_id, key);
        }
    }

    fn remove_entry(&mut self, index_id: i32, key: &DocumentKey) {
        let slot = (index_id, key.clone());
        let Some(old) = self.entry_by_doc.get(&slot).cloned() else {
            return;
        };
        self.entry_by_doc = self.entry_by_doc.remove(&slot);
        if let Some(entries) = self.entries.get(&index_id) {
            let entries = entries.remove(&old);
            self.entries = self.entries.insert(index_id, entries);
        }
    }

    fn update_entry(&mut self, index: &FieldIndex, doc: &MutableDocument) {
        self.remove_entry(index.index_id, doc.key());
        if let Some(entry) = index.entry_for(doc) {
            let entries = self
                .entries
                .get(&index.index_id)
                .cloned()
                .unwrap_or_else(|| Entries::with_comparator(IndexEntryComparator))
                .insert(entry.clone());
            self.entries = self.entries.insert(index.index_id, entries);
            self.entry_by_doc = self
                .entry_by_doc
                .insert((index.index_id, doc.key().clone()), entry);
        }
    }

    /// Removes every index and its entries.
    pub fn delete_all_field_indexes(&mut self, writes: &mut WriteBatch) {
        writes.delete_prefix(INDEX_PREFIX.as_bytes().to_vec());
        let next_index_id = self.next_index_id;
        *self = Self {
            next_index_id,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectValue;
    use crate::query::{field_filter, Operator, OrderBy, Query};

    fn doc(path: &str, city: &str, age: i64, read: i64) -> MutableDocument {
        let version = SnapshotVersion::from_micros(read);
        let mut doc = MutableDocument::new_found(
            DocumentKey::parse(path).unwrap(),
            version,
            ObjectValue::from_pairs([("city", Value::from(city)), ("age", Value::Integer(age))]),
        );
        doc.set_read_time(version);
        doc
    }

    fn cache(docs: &[MutableDocument]) -> RemoteDocumentCache {
        let mut cache = RemoteDocumentCache::default();
        let mut writes = WriteBatch::new();
        for doc in docs {
            cache.add(&mut writes, doc.clone()).unwrap();
        }
        cache
    }

    fn city_target(city: &str) -> Target {
        Query::collection("users")
            .unwrap()
            .with_filter(field_filter("city", Operator::Equal, city).unwrap())
            .with_order_by(OrderBy::asc(FieldPath::parse("age").unwrap()))
            .to_target()
    }

    #[test]
    fn index_scan_returns_equal_prefix() {
        let remote = cache(&[
            doc("users/a", "Oslo", 30, 1),
            doc("users/b", "Rome", 20, 2),
            doc("users/c", "Oslo", 10, 3),
        ]);
        let mut manager = IndexManager::default();
        let mut writes = WriteBatch::new();
        let index = manager
            .create_target_indexes(&mut writes, &city_target("Oslo"), &remote)
            .unwrap()
            .unwrap();
        assert!(manager.is_caught_up(&index, &remote));
        assert!(manager
            .create_target_indexes(&mut writes, &city_target("Rome"), &remote)
            .unwrap()
            .is_none());

        let keys = manager.get_documents_matching_target(&city_target("Oslo")).unwrap();
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(keys, ["users/c", "users/a"]);
    }

    #[test]
    fn updates_move_entries() {
        let remote = cache(&[doc("users/a", "Oslo", 30, 1)]);
        let mut manager = IndexManager::default();
        let mut writes = WriteBatch::new();
        manager
            .create_target_indexes(&mut writes, &city_target("Oslo"), &remote)
            .unwrap();

        let moved = doc("users/a", "Rome", 30, 5);
        manager.update_index_entries([&moved], SnapshotVersion::from_micros(5));
        assert!(manager
            .get_documents_matching_target(&city_target("Oslo"))
            .unwrap()
            .is_empty());
        assert_eq!(
            manager
                .get_documents_matching_target(&city_target("Rome"))
                .unwrap()
                .len(),
            1
        );

        manager.remove_document(moved.key());
        assert!(manager
            .get_documents_matching_target(&city_target("Rome"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_all_clears_definitions() {
        let remote = cache(&[doc("users/a", "Oslo", 30, 1)]);
        let mut manager = IndexManager::default();
        let mut writes = WriteBatch::new();
        manager
            .create_target_indexes(&mut writes, &city_target("Oslo"), &remote)
            .unwrap();
        manager.delete_all_field_indexes(&mut writes);
        assert!(manager.field_indexes().is_empty());
        assert!(manager.get_documents_matching_target(&city_target("Oslo")).is_none());
    }
}
