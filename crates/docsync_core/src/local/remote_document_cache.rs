//! Cache of the last known backend state of each document.

use super::schema::{self, DOC_PREFIX};
use crate::error::CoreResult;
use crate::model::{DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, ResourcePath, SnapshotVersion};
use docsync_storage::{KvStore, WriteBatch};

/// Documents as last reported by the backend (or as committed by an
/// acknowledged write), keyed by document key.
///
/// Every entry carries the read time at which it was written so that
/// queries can ask for "everything that changed since".
#[derive(Debug, Clone, Default)]
pub struct RemoteDocumentCache {
    docs: DocumentMap,
    latest_read_time: SnapshotVersion,
}

impl RemoteDocumentCache {
    pub(crate) fn load(store: &dyn KvStore) -> CoreResult<Self> {
        let mut cache = Self::default();
        for (key, value) in store.scan_prefix(DOC_PREFIX.as_bytes())? {
            let doc: MutableDocument = schema::decode(&key, &value)?;
            cache.latest_read_time = cache.latest_read_time.max(doc.read_time());
            cache.docs = cache.docs.insert(doc.key().clone(), doc);
        }
        Ok(cache)
    }

    /// Stores `doc`, replacing any previous entry.
    pub fn add(&mut self, writes: &mut WriteBatch, doc: MutableDocument) -> CoreResult<()> {
        writes.put(schema::doc_key(doc.key()), schema::encode(&doc)?);
        self.latest_read_time = self.latest_read_time.max(doc.read_time());
        self.docs = self.docs.insert(doc.key().clone(), doc);
        Ok(())
    }

    /// Removes the entry for `key`.
    pub fn remove(&mut self, writes: &mut WriteBatch, key: &DocumentKey) {
        if self.docs.contains_key(key) {
            writes.delete(schema::doc_key(key));
            self.docs = self.docs.remove(key);
        }
    }

    /// Returns the cached document, or an invalid document if unknown.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid(key.clone()))
    }

    /// Returns the cached documents for `keys`. Unknown keys map to invalid
    /// documents.
    pub fn get_all(&self, keys: &DocumentKeySet) -> DocumentMap {
        keys.iter().fold(DocumentMap::new(), |map, key| {
            map.insert(key.clone(), self.get(key))
        })
    }

    /// Returns true if a document is cached for `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.docs.contains_key(key)
    }

    /// Returns the documents directly inside `collection` whose read time is
    /// after `since_read_time`, plus the number of documents scanned.
    pub fn get_documents_matching_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> (DocumentMap, usize) {
        let mut scanned = 0;
        let mut result = DocumentMap::new();
        let start = DocumentKey::scan_start(collection);
        for (key, doc) in self
            .docs
            .iter_from(&start)
            .take_while(|(k, _)| collection.is_prefix_of(k.path()))
        {
            if !key.has_collection(collection) {
                continue;
            }
            scanned += 1;
            if doc.read_time() > since_read_time {
                result = result.insert(key.clone(), doc.clone());
            }
        }
        (result, scanned)
    }

    /// Returns the number of documents cached directly inside `collection`.
    pub fn collection_size(&self, collection: &ResourcePath) -> usize {
        self.get_documents_matching_collection(collection, SnapshotVersion::NONE)
            .1
    }

    /// Returns every document cached directly inside `collection`.
    pub(crate) fn collection_documents<'a>(
        &'a self,
        collection: &'a ResourcePath,
    ) -> impl Iterator<Item = &'a MutableDocument> + 'a {
        let start = DocumentKey::scan_start(collection);
        self.docs
            .iter_from(&start)
            .take_while(move |(k, _)| collection.is_prefix_of(k.path()))
            .filter(move |(k, _)| k.has_collection(collection))
            .map(|(_, doc)| doc)
    }

    /// Returns the highest read time of any cached document.
    pub fn latest_read_time(&self) -> SnapshotVersion {
        self.latest_read_time
    }

    /// Returns the number of cached documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }
}
