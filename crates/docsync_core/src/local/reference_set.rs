//! Reference counting between document keys and targets or batches.

use crate::collections::SortedSet;
use crate::model::{DocumentKey, DocumentKeySet};

/// A set of `(key, id)` references, indexed both ways.
///
/// Used for target membership, for documents pinned by active views and
/// for limbo documents. A key with no remaining reference is a garbage
/// collection candidate.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    by_key: SortedSet<(DocumentKey, i32)>,
    by_id: SortedSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if there are no references.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Adds a reference from `id` to `key`.
    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_key = self.by_key.insert((key.clone(), id));
        self.by_id = self.by_id.insert((id, key));
    }

    /// Adds references from `id` to each key.
    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    /// Removes the reference from `id` to `key`.
    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key = self.by_key.remove(&(key.clone(), id));
        self.by_id = self.by_id.remove(&(id, key.clone()));
    }

    /// Removes references from `id` to each key.
    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Removes every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(id).iter().cloned().collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    /// Removes every reference and returns the keys that were referenced.
    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.by_key.iter().map(|(k, _)| k.clone()).collect();
        self.by_key = SortedSet::new();
        self.by_id = SortedSet::new();
        keys
    }

    /// Returns the keys referenced by `id`.
    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id
            .iter_from(&(id, DocumentKey::min()))
            .take_while(|(i, _)| *i == id)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Returns true if any id references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter_from(&(key.clone(), i32::MIN))
            .next()
            .is_some_and(|(k, _)| k == key)
    }
}
