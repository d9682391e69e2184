//! Documents in query order.

use docsync_core::{DocumentComparator, DocumentKey, MutableDocument, Query, SortedMap, SortedSet};
use std::fmt;

/// An immutable set of documents ordered by a query's comparator, with
/// lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    by_key: SortedMap<DocumentKey, MutableDocument>,
    sorted: SortedSet<MutableDocument, DocumentComparator>,
}

impl DocumentSet {
    /// Creates an empty set ordered by `comparator`.
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            by_key: SortedMap::new(),
            sorted: SortedSet::with_comparator(comparator),
        }
    }

    /// Creates an empty set ordered like `query`'s results.
    pub fn for_query(query: &Query) -> Self {
        Self::new(query.comparator())
    }

    /// Creates an empty set with the same order as `other`.
    pub fn empty_like(other: &DocumentSet) -> Self {
        Self::new(other.sorted.comparator().clone())
    }

    /// Returns the number of documents.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Returns true if a document with `key` is in the set.
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Returns the document with `key`.
    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    /// Returns the first document in query order.
    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    /// Returns the last document in query order.
    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Returns the position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        self.by_key.get(key).and_then(|doc| self.sorted.index_of(doc))
    }

    /// Returns a set with `doc` added, replacing any document with the same
    /// key.
    #[must_use]
    pub fn add(&self, doc: MutableDocument) -> Self {
        let removed = self.delete(doc.key());
        Self {
            by_key: removed.by_key.insert(doc.key().clone(), doc.clone()),
            sorted: removed.sorted.insert(doc),
        }
    }

    /// Returns a set without the document with `key`.
    #[must_use]
    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.by_key.get(key) {
            Some(doc) => Self {
                by_key: self.by_key.remove(key),
                sorted: self.sorted.remove(doc),
            },
            None => self.clone(),
        }
    }

    /// Iterates in query order.
    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> + '_ {
        self.sorted.iter()
    }

    /// Iterates over the keys in query order.
    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter().map(MutableDocument::key)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{FieldPath, ObjectValue, OrderBy, SnapshotVersion, Value};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        MutableDocument::new_found(
            DocumentKey::parse(path).unwrap(),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_pairs([("rank", Value::Integer(rank))]),
        )
    }

    fn by_rank_desc() -> DocumentSet {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::desc(FieldPath::parse("rank").unwrap()));
        DocumentSet::for_query(&query)
    }

    #[test]
    fn keeps_query_order() {
        let set = by_rank_desc().add(doc("rooms/a", 1)).add(doc("rooms/b", 3)).add(doc("rooms/c", 2));
        let keys: Vec<_> = set.keys().map(|k| k.document_id().to_string()).collect();
        assert_eq!(keys, ["b", "c", "a"]);
        assert_eq!(set.first().unwrap().key().document_id(), "b");
        assert_eq!(set.last().unwrap().key().document_id(), "a");
        assert_eq!(set.index_of(&DocumentKey::parse("rooms/c").unwrap()), Some(1));
    }

    #[test]
    fn replacing_a_document_moves_it() {
        let set = by_rank_desc().add(doc("rooms/a", 1)).add(doc("rooms/b", 3));
        let moved = set.add(doc("rooms/a", 5));
        assert_eq!(moved.len(), 2);
        assert_eq!(moved.first().unwrap().key().document_id(), "a");
        assert_eq!(set.first().unwrap().key().document_id(), "b");
    }

    #[test]
    fn delete_missing_key_is_a_no_op() {
        let set = by_rank_desc().add(doc("rooms/a", 1));
        let same = set.delete(&DocumentKey::parse("rooms/zzz").unwrap());
        assert_eq!(same, set);
        assert!(set.delete(&DocumentKey::parse("rooms/a").unwrap()).is_empty());
    }
}
