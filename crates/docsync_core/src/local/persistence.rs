//! Transactions over the local caches and their durable store.

use super::index_manager::IndexManager;
use super::mutation_queue::MutationQueue;
use super::overlay_cache::OverlayCache;
use super::remote_document_cache::RemoteDocumentCache;
use super::target_cache::TargetCache;
use crate::error::{CoreError, CoreResult};
use crate::model::DocumentKey;
use docsync_storage::{KvStore, WriteBatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// The complete in-memory state of the local caches.
///
/// Every cache is built on persistent maps, so cloning the state at the
/// start of a transaction is cheap and leaves the committed state intact
/// until the transaction commits.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalState {
    pub(crate) remote_documents: RemoteDocumentCache,
    pub(crate) mutation_queue: MutationQueue,
    pub(crate) overlays: OverlayCache,
    pub(crate) targets: TargetCache,
    pub(crate) indexes: IndexManager,
}

impl LocalState {
    fn load(store: &dyn KvStore) -> CoreResult<Self> {
        let remote_documents = RemoteDocumentCache::load(store)?;
        let indexes = IndexManager::load(store, &remote_documents)?;
        Ok(Self {
            mutation_queue: MutationQueue::load(store)?,
            overlays: OverlayCache::load(store)?,
            targets: TargetCache::load(store)?,
            remote_documents,
            indexes,
        })
    }
}

/// A unit of work against the local caches.
///
/// Changes are made to a private copy of the state and recorded in a write
/// batch. Nothing is visible until [`Persistence::commit`] succeeds;
/// dropping the transaction discards it.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) name: &'static str,
    pub(crate) state: LocalState,
    pub(crate) writes: WriteBatch,
    pub(crate) orphaned: BTreeSet<DocumentKey>,
}

impl Transaction {
    /// Marks `key` as possibly unreferenced.
    pub(crate) fn mark_orphaned(&mut self, key: DocumentKey) {
        self.orphaned.insert(key);
    }
}

/// Owner of the committed local state and of the optional durable store.
pub struct Persistence {
    store: Option<Arc<dyn KvStore>>,
    state: LocalState,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("memory_only", &self.is_memory_only())
            .finish_non_exhaustive()
    }
}

impl Persistence {
    /// Creates persistence without a durable store.
    pub fn memory_only() -> Self {
        Self {
            store: None,
            state: LocalState::default(),
        }
    }

    /// Opens persistence over `store`, loading everything it holds.
    ///
    /// If the store reports itself unavailable the engine continues
    /// memory-only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] if persisted records cannot be
    /// decoded, or the storage error for other failures.
    pub fn open(store: Arc<dyn KvStore>) -> CoreResult<Self> {
        let loaded = store
            .check_available()
            .map_err(CoreError::from)
            .and_then(|()| LocalState::load(store.as_ref()));
        match loaded {
            Ok(state) => {
                debug!(
                    documents = state.remote_documents.len(),
                    batches = state.mutation_queue.len(),
                    targets = state.targets.target_count(),
                    "loaded local state"
                );
                Ok(Self {
                    store: Some(store),
                    state,
                })
            }
            Err(CoreError::Storage(e)) if e.is_unavailable() => {
                warn!(error = %e, "durable storage unavailable, running memory-only");
                Ok(Self::memory_only())
            }
            Err(e) => Err(e),
        }
    }

    /// Returns true if nothing is persisted durably.
    pub fn is_memory_only(&self) -> bool {
        self.store.is_none()
    }

    pub(crate) fn state(&self) -> &LocalState {
        &self.state
    }

    pub(crate) fn begin(&self, name: &'static str) -> Transaction {
        Transaction {
            name,
            state: self.state.clone(),
            writes: WriteBatch::new(),
            orphaned: BTreeSet::new(),
        }
    }

    /// Commits `txn`: its writes go to the durable store and its state
    /// becomes the committed state.
    ///
    /// A store that turns unavailable mid-flight is dropped and the
    /// transaction still succeeds in memory. Any other storage failure
    /// aborts the transaction.
    pub(crate) fn commit(&mut self, txn: Transaction) -> CoreResult<()> {
        let Transaction {
            name,
            state,
            writes,
            ..
        } = txn;
        let result = match &self.store {
            Some(store) if !writes.is_empty() => store.commit(writes),
            _ => Ok(()),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_unavailable() => {
                warn!(transaction = name, error = %e, "durable storage lost, continuing memory-only");
                self.store = None;
            }
            Err(e) => {
                debug!(transaction = name, error = %e, "transaction aborted");
                return Err(e.into());
            }
        }
        self.state = state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MutableDocument, SnapshotVersion};
    use docsync_storage::MemoryKvStore;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn write_doc(persistence: &mut Persistence, path: &str) -> CoreResult<()> {
        let mut txn = persistence.begin("write_doc");
        let doc = MutableDocument::new_no_document(key(path), SnapshotVersion::from_micros(1));
        txn.state.remote_documents.add(&mut txn.writes, doc)?;
        persistence.commit(txn)
    }

    #[test]
    fn committed_state_survives_reopen() {
        let store = Arc::new(MemoryKvStore::new());
        let mut persistence = Persistence::open(store.clone()).unwrap();
        write_doc(&mut persistence, "rooms/a").unwrap();

        let reopened = Persistence::open(store).unwrap();
        assert!(reopened.state().remote_documents.contains_key(&key("rooms/a")));
    }

    #[test]
    fn dropped_transaction_changes_nothing() {
        let mut persistence = Persistence::memory_only();
        {
            let mut txn = persistence.begin("abandoned");
            let doc = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::NONE);
            txn.state.remote_documents.add(&mut txn.writes, doc).unwrap();
        }
        assert_eq!(persistence.state().remote_documents.len(), 0);
        write_doc(&mut persistence, "rooms/b").unwrap();
        assert_eq!(persistence.state().remote_documents.len(), 1);
    }

    #[test]
    fn failed_commit_keeps_old_state() {
        let store = Arc::new(MemoryKvStore::new());
        let mut persistence = Persistence::open(store.clone()).unwrap();
        store.fail_next_commit();
        assert!(write_doc(&mut persistence, "rooms/a").is_err());
        assert_eq!(persistence.state().remote_documents.len(), 0);
        assert!(!persistence.is_memory_only());
    }

    #[test]
    fn unavailable_store_fails_over_to_memory() {
        let store = Arc::new(MemoryKvStore::new());
        let mut persistence = Persistence::open(store.clone()).unwrap();
        store.set_available(false);
        write_doc(&mut persistence, "rooms/a").unwrap();
        assert!(persistence.is_memory_only());
        assert_eq!(persistence.state().remote_documents.len(), 1);

        let unavailable = Arc::new(MemoryKvStore::unavailable());
        assert!(Persistence::open(unavailable).unwrap().is_memory_only());
    }

    #[test]
    fn corrupted_records_fail_open() {
        let store = Arc::new(MemoryKvStore::new());
        store.put(b"doc/rooms/a", &[0xff]).unwrap();
        let err = Persistence::open(store).unwrap_err();
        assert!(matches!(err, CoreError::Corrupted { .. }));
    }
}
