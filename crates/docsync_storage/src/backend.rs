//! Key-range store trait definition.

use crate::error::StorageResult;

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key.
    Put {
        /// The key to write.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Remove a key. Removing a missing key is not an error.
    Delete {
        /// The key to remove.
        key: Vec<u8>,
    },
    /// Remove every key starting with `prefix`.
    DeletePrefix {
        /// The key prefix to clear.
        prefix: Vec<u8>,
    },
}

/// An ordered list of writes applied atomically by [`KvStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    /// Queues a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    /// Queues removal of every key under `prefix`.
    pub fn delete_prefix(&mut self, prefix: Vec<u8>) {
        self.ops.push(WriteOp::DeletePrefix { prefix });
    }

    /// Appends all writes of `other` after the writes of `self`.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Returns the queued writes in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// A transactional key-range store.
///
/// Stores are **ordered byte maps**. The docsync local store owns the key
/// layout and value encoding; implementations only guarantee ordering and
/// atomicity.
///
/// # Invariants
///
/// - `scan_prefix` yields entries in ascending key order
/// - `commit` applies every op of the batch, in order, or none of them
/// - After `commit` returns `Ok`, the writes are visible to `get`/`scan_prefix`
/// - Stores must be `Send + Sync`
pub trait KvStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or the read fails.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns all entries whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or the read fails.
    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically applies a batch of writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be applied. In that case no
    /// write of the batch is visible.
    fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Writes a single key.
    ///
    /// # Errors
    ///
    /// See [`KvStore::commit`].
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key.to_vec(), value.to_vec());
        self.commit(batch)
    }

    /// Removes a single key.
    ///
    /// # Errors
    ///
    /// See [`KvStore::commit`].
    fn delete(&self, key: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key.to_vec());
        self.commit(batch)
    }

    /// Checks whether the store can be used.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Unavailable`] if the store cannot be
    /// used at all.
    fn check_available(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.delete(b"a".to_vec());
        batch.delete_prefix(b"b/".to_vec());

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::Put { .. }));
        assert!(matches!(batch.ops()[1], WriteOp::Delete { .. }));
        assert!(matches!(batch.ops()[2], WriteOp::DeletePrefix { .. }));
    }

    #[test]
    fn extend_appends() {
        let mut first = WriteBatch::new();
        first.put(b"a".to_vec(), b"1".to_vec());
        let mut second = WriteBatch::new();
        second.delete(b"a".to_vec());

        first.extend(second);
        assert_eq!(first.len(), 2);
        assert!(!first.is_empty());
    }
}
