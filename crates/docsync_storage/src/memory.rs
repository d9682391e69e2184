//! In-memory key-range store.

use crate::backend::{KvStore, WriteBatch, WriteOp};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory key-range store.
///
/// This store keeps all data in a `BTreeMap` and is suitable for:
/// - Unit and integration tests
/// - Ephemeral engines that don't need persistence across restarts
///
/// It can also simulate failures: [`MemoryKvStore::set_available`] makes
/// every call report [`StorageError::Unavailable`], and
/// [`MemoryKvStore::fail_next_commit`] makes the next commit fail without
/// applying anything.
///
/// # Example
///
/// ```rust
/// use docsync_storage::{KvStore, MemoryKvStore};
///
/// let store = MemoryKvStore::new();
/// store.put(b"k", b"v").unwrap();
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    available: AtomicBool,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            fail_next_commit: AtomicBool::new(false),
            commits: AtomicU64::new(0),
        }
    }
}

impl MemoryKvStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that reports itself unavailable.
    #[must_use]
    pub fn unavailable() -> Self {
        let store = Self::default();
        store.set_available(false);
        store
    }

    /// Toggles availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next commit fail without applying any write.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns a copy of every stored key, in order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.data.read().keys().cloned().collect()
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store disabled".into()))
        }
    }

    fn prefix_range<'a>(
        data: &'a BTreeMap<Vec<u8>, Vec<u8>>,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
        data.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_available()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_available()?;
        let data = self.data.read();
        Ok(Self::prefix_range(&data, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        self.ensure_available()?;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            tracing::debug!(ops = batch.len(), "simulated commit failure");
            return Err(StorageError::CommitFailed("simulated failure".into()));
        }

        // The write lock is held for the whole batch, so readers never
        // observe a partially applied batch.
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
                WriteOp::DeletePrefix { prefix } => {
                    let doomed: Vec<Vec<u8>> = Self::prefix_range(&data, &prefix)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in doomed {
                        data.remove(&key);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_available(&self) -> StorageResult<()> {
        self.ensure_available()
    }
}
