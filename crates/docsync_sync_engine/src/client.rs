//! The application-facing document store.
//!
//! [`DocumentStore`] is a cheap, cloneable handle. Every call is turned into
//! a job on the store's [`AsyncQueue`], where the sync engine runs.

use crate::async_queue::AsyncQueue;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::credentials::{CredentialsProvider, EmptyCredentialsProvider};
use crate::error::{SyncError, SyncResult};
use crate::event_manager::{ListenOptions, ListenerId, QueryListener};
use crate::online_state::OnlineState;
use crate::sync_engine::{SharedEngine, SyncEngine};
use crate::transaction::{Transaction, TransactionRunner};
use crate::user_data::{parse_set, parse_update, DocumentData, SetOptions};
use crate::view_snapshot::ViewSnapshot;
use docsync_codec::Value;
use docsync_core::{
    DocumentKey, FieldPath, LocalStore, MutableDocument, Mutation, ObjectValue, Precondition, Query, ResourcePath,
};
use docsync_storage::KvStore;
use futures::Stream;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Length of generated document ids.
const AUTO_ID_LENGTH: usize = 20;

/// Where a one-time read gets its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Source {
    /// The backend when reachable, otherwise the cache.
    #[default]
    Default,
    /// The backend only; fails while offline.
    Server,
    /// The local cache only.
    Cache,
}

/// Where a document snapshot came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Whether the data may be stale.
    pub from_cache: bool,
    /// Whether local writes are not yet acknowledged.
    pub has_pending_writes: bool,
}

/// A document read at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    document: Option<MutableDocument>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub(crate) fn new(key: DocumentKey, document: Option<MutableDocument>, from_cache: bool) -> Self {
        let has_pending_writes = document.as_ref().is_some_and(MutableDocument::has_local_mutations);
        Self {
            key,
            document: document.filter(MutableDocument::is_found_document),
            metadata: SnapshotMetadata {
                from_cache,
                has_pending_writes,
            },
        }
    }

    pub(crate) fn from_server(doc: MutableDocument) -> Self {
        Self::new(doc.key().clone(), Some(doc), false)
    }

    fn from_view(key: DocumentKey, snapshot: &ViewSnapshot) -> Self {
        let document = snapshot.docs.get(&key).cloned();
        let has_pending_writes = snapshot.mutated_keys.contains(&key);
        Self {
            key,
            document,
            metadata: SnapshotMetadata {
                from_cache: snapshot.from_cache,
                has_pending_writes,
            },
        }
    }

    /// Returns the document's key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Returns true if the document exists.
    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    /// Returns the document's fields.
    pub fn data(&self) -> Option<&ObjectValue> {
        self.document.as_ref().and_then(MutableDocument::data)
    }

    /// Returns one field, given as a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let path = FieldPath::parse(path).ok()?;
        self.data()?.field(&path)
    }

    /// Returns the underlying document.
    pub fn document(&self) -> Option<&MutableDocument> {
        self.document.as_ref()
    }

    /// Returns the snapshot's metadata.
    pub fn metadata(&self) -> SnapshotMetadata {
        self.metadata
    }
}

struct Inner {
    engine: SharedEngine,
    queue: AsyncQueue,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    config: EngineConfig,
    online_state: watch::Receiver<OnlineState>,
    next_listener_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

/// Handle to a document store client.
///
/// Writes are applied to the local cache immediately and complete once
/// the backend acknowledges them. Reads and listeners see local writes
/// right away.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("online_state", &*self.inner.online_state.borrow())
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    /// Opens a store that caches in memory only.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open_in_memory(connection: Arc<dyn Connection>) -> SyncResult<Self> {
        Self::open_with_config(
            connection,
            Arc::new(EmptyCredentialsProvider),
            EngineConfig::default().with_persistence(false),
        )
    }

    /// Opens a memory-only store with custom credentials and configuration.
    pub fn open_with_config(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let local_store = LocalStore::memory_only(config.local_store.clone());
        Ok(Self::start(local_store, connection, credentials, config))
    }

    /// Opens a store persisting its cache to `store`.
    ///
    /// If `store` is unavailable the cache is kept in memory. With
    /// persistence disabled in `config`, `store` is not touched.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be decoded.
    pub fn open_with_backends(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        store: Arc<dyn KvStore>,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let local_store = if config.persistence_enabled {
            LocalStore::open(store, config.local_store.clone())?
        } else {
            LocalStore::memory_only(config.local_store.clone())
        };
        Ok(Self::start(local_store, connection, credentials, config))
    }

    fn start(
        local_store: LocalStore,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        config: EngineConfig,
    ) -> Self {
        info!(memory_only = local_store.is_memory_only(), "starting document store");
        let queue = AsyncQueue::new();
        let (engine, online_state) = SyncEngine::start(
            local_store,
            Arc::clone(&connection),
            Arc::clone(&credentials),
            &config,
            queue.clone(),
        );
        let store = Self {
            inner: Arc::new(Inner {
                engine,
                queue,
                connection,
                credentials,
                config,
                online_state,
                next_listener_id: AtomicU64::new(1),
            }),
        };
        let engine = Arc::clone(&store.inner.engine);
        store.inner.queue.enqueue_and_forget(async move {
            if let Err(e) = engine.lock().enable_network() {
                warn!(error = %e, "failed to enable the network");
            }
        });
        store
    }

    /// Returns the queue the engine runs on.
    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    /// Returns the store's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn run_on_engine<T, F>(&self, op: F) -> impl Future<Output = SyncResult<T>> + Send + 'static
    where
        F: FnOnce(&mut SyncEngine) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.inner.engine);
        let job = self.inner.queue.enqueue(async move { op(&mut *engine.lock()) });
        async move { job.await? }
    }

    // === Writes ===

    async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.run_on_engine(move |engine| {
            engine.write(mutations, tx);
            Ok(())
        })
        .await?;
        rx.await.map_err(|_| SyncError::Terminated)?
    }

    /// Writes a document. Completes when the backend accepts the write.
    pub async fn set(&self, path: &str, data: DocumentData, options: SetOptions) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        let mutation = parse_set(key, &data, &options)?;
        self.write(vec![mutation]).await
    }

    /// Updates fields of an existing document.
    pub async fn update(&self, path: &str, data: DocumentData) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        let mutation = parse_update(key, &data)?;
        self.write(vec![mutation]).await
    }

    /// Deletes a document.
    pub async fn delete(&self, path: &str, precondition: Precondition) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        self.write(vec![Mutation::delete(key).with_precondition(precondition)])
            .await
    }

    /// Creates a document with a generated id in `collection_path` and
    /// returns its key.
    ///
    /// The key is known immediately; the returned future completes when
    /// the backend accepts the write.
    pub async fn add(&self, collection_path: &str, data: DocumentData) -> SyncResult<DocumentKey> {
        let collection = ResourcePath::parse(collection_path)?;
        let key = DocumentKey::from_path(collection.child(auto_id()))?;
        let mutation = parse_set(key.clone(), &data, &SetOptions::Overwrite)?;
        self.write(vec![mutation]).await?;
        Ok(key)
    }

    /// Starts an atomic batch of writes.
    pub fn batch(&self) -> WriteBatch {
        WriteBatch {
            store: self.clone(),
            mutations: Vec::new(),
        }
    }

    /// Commits `mutations` atomically.
    pub async fn commit_batch(&self, mutations: Vec<Mutation>) -> SyncResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.write(mutations).await
    }

    /// Completes once every write issued so far is acknowledged or
    /// rejected by the backend.
    pub async fn wait_for_pending_writes(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.run_on_engine(move |engine| {
            engine.register_pending_writes_callback(tx);
            Ok(())
        })
        .await?;
        rx.await.map_err(|_| SyncError::Terminated)?
    }

    /// Runs `update` in a transaction, retrying on contention.
    ///
    /// Transactions read from the backend and fail while offline.
    pub async fn run_transaction<T, F, Fut>(&self, update: F) -> SyncResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if self.inner.queue.is_shutting_down() {
            return Err(SyncError::Terminated);
        }
        TransactionRunner::new(
            self.inner.queue.clone(),
            Arc::clone(&self.inner.connection),
            Arc::clone(&self.inner.credentials),
            self.inner.config.backoff.clone(),
            self.inner.config.max_transaction_attempts,
        )
        .run(update)
        .await
    }

    // === Reads ===

    /// Reads one document.
    pub async fn get_document(&self, path: &str, source: Source) -> SyncResult<DocumentSnapshot> {
        let key = DocumentKey::parse(path)?;
        if source == Source::Cache {
            let lookup = key.clone();
            let doc = self
                .run_on_engine(move |engine| engine.read_document_from_cache(&lookup))
                .await?;
            if doc.is_found_document() || doc.is_no_document() {
                return Ok(DocumentSnapshot::new(key, Some(doc), true));
            }
            return Err(SyncError::Unavailable(format!(
                "{key} is not in the cache; get it from the server instead"
            )));
        }

        let snapshot = self.get_via_listener(Query::document(&key)).await?;
        let doc = DocumentSnapshot::from_view(key, &snapshot);
        if doc.metadata.from_cache && (!doc.exists() || source == Source::Server) {
            return Err(SyncError::Unavailable(format!(
                "failed to get {} because the client is offline",
                doc.key
            )));
        }
        Ok(doc)
    }

    /// Runs a query once.
    pub async fn get_documents(&self, query: Query, source: Source) -> SyncResult<ViewSnapshot> {
        if source == Source::Cache {
            return self.run_on_engine(move |engine| engine.query_from_cache(&query)).await;
        }
        let snapshot = self.get_via_listener(query).await?;
        if source == Source::Server && snapshot.from_cache {
            return Err(SyncError::Unavailable(
                "failed to get documents from the server because the client is offline".into(),
            ));
        }
        Ok(snapshot)
    }

    async fn get_via_listener(&self, query: Query) -> SyncResult<ViewSnapshot> {
        let options = ListenOptions::default()
            .with_include_metadata_changes(true)
            .with_wait_for_sync_when_online(true);
        let mut stream = self.snapshots(query, options);
        match futures::StreamExt::next(&mut stream).await {
            Some(result) => result,
            None => Err(SyncError::Terminated),
        }
    }

    // === Listeners ===

    /// Listens to `query`, delivering snapshots on a stream.
    ///
    /// Dropping the stream stops the listener.
    pub fn snapshots(&self, query: Query, options: ListenOptions) -> SnapshotStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registration = self.register_listener(query, options, sender);
        SnapshotStream {
            receiver,
            _registration: registration,
        }
    }

    /// Listens to `query`, calling `callback` with every snapshot or error.
    ///
    /// The listener stops when the returned registration is removed or
    /// dropped, or after the first error.
    pub fn add_snapshot_listener<F>(&self, query: Query, options: ListenOptions, mut callback: F) -> ListenerRegistration
    where
        F: FnMut(SyncResult<ViewSnapshot>) + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let registration = self.register_listener(query, options, sender);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let failed = event.is_err();
                callback(event);
                if failed {
                    break;
                }
            }
        });
        registration
    }

    fn register_listener(
        &self,
        query: Query,
        options: ListenOptions,
        sender: mpsc::UnboundedSender<SyncResult<ViewSnapshot>>,
    ) -> ListenerRegistration {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        debug!(listener = id, query = %query.canonical_id(), "adding listener");
        let listener = QueryListener::new(id, query.clone(), options, sender);
        let engine = Arc::clone(&self.inner.engine);
        self.inner.queue.enqueue_and_forget(async move {
            // Failures are delivered to the listener itself.
            let _ = engine.lock().listen(listener);
        });
        ListenerRegistration {
            engine: Arc::clone(&self.inner.engine),
            queue: self.inner.queue.clone(),
            query,
            id,
            removed: false,
        }
    }

    // === Network and lifecycle ===

    /// Reconnects to the backend after [`DocumentStore::disable_network`].
    pub async fn enable_network(&self) -> SyncResult<()> {
        self.run_on_engine(SyncEngine::enable_network).await
    }

    /// Disconnects from the backend. Reads are served from the cache and
    /// writes queue up locally.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.run_on_engine(SyncEngine::disable_network).await
    }

    /// Reconnects with fresh credentials after the token changed.
    pub async fn handle_credential_change(&self) -> SyncResult<()> {
        self.run_on_engine(SyncEngine::handle_credential_change).await
    }

    /// Returns the current connectivity estimate.
    pub fn online_state(&self) -> OnlineState {
        *self.inner.online_state.borrow()
    }

    /// Returns a receiver that observes connectivity changes.
    pub fn online_state_listener(&self) -> watch::Receiver<OnlineState> {
        self.inner.online_state.clone()
    }

    /// Stops the store. Outstanding writes and listeners fail with
    /// [`SyncError::Terminated`].
    pub async fn terminate(&self) -> SyncResult<()> {
        let engine = Arc::clone(&self.inner.engine);
        let result = self
            .inner
            .queue
            .enqueue_even_while_restricted(async move { engine.lock().terminate() })
            .await;
        self.inner.queue.shutdown();
        match result {
            Ok(()) | Err(SyncError::Terminated) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns true once the store was terminated or stopped after a fatal
    /// error.
    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shutting_down() || self.inner.engine.lock().is_terminated()
    }
}

fn auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Keeps a query listener alive. Dropping it removes the listener.
#[derive(Debug)]
pub struct ListenerRegistration {
    engine: SharedEngine,
    queue: AsyncQueue,
    query: Query,
    id: ListenerId,
    removed: bool,
}

impl ListenerRegistration {
    /// Removes the listener.
    pub fn remove(mut self) {
        self.unlisten();
    }

    fn unlisten(&mut self) {
        if std::mem::replace(&mut self.removed, true) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let query = self.query.clone();
        let id = self.id;
        self.queue.enqueue_and_forget(async move {
            if let Err(e) = engine.lock().unlisten(&query, id) {
                warn!(error = %e, "failed to remove listener");
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.unlisten();
    }
}

/// Snapshots of a listened query. Ends after an error.
#[derive(Debug)]
pub struct SnapshotStream {
    receiver: mpsc::UnboundedReceiver<SyncResult<ViewSnapshot>>,
    _registration: ListenerRegistration,
}

impl Stream for SnapshotStream {
    type Item = SyncResult<ViewSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Writes committed together. Build with [`DocumentStore::batch`].
#[derive(Debug)]
pub struct WriteBatch {
    store: DocumentStore,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    /// Adds a set.
    pub fn set(&mut self, path: &str, data: DocumentData, options: SetOptions) -> SyncResult<&mut Self> {
        let key = DocumentKey::parse(path)?;
        self.mutations.push(parse_set(key, &data, &options)?);
        Ok(self)
    }

    /// Adds an update.
    pub fn update(&mut self, path: &str, data: DocumentData) -> SyncResult<&mut Self> {
        let key = DocumentKey::parse(path)?;
        self.mutations.push(parse_update(key, &data)?);
        Ok(self)
    }

    /// Adds a delete.
    pub fn delete(&mut self, path: &str) -> SyncResult<&mut Self> {
        let key = DocumentKey::parse(path)?;
        self.mutations.push(Mutation::delete(key));
        Ok(self)
    }

    /// Returns the number of queued writes.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if nothing was added.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Commits the writes atomically.
    pub async fn commit(self) -> SyncResult<()> {
        self.store.commit_batch(self.mutations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::SnapshotVersion;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn auto_ids_are_alphanumeric() {
        let id = auto_id();
        assert_eq!(id.len(), AUTO_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(auto_id(), id);
    }

    #[test]
    fn missing_documents_do_not_exist() {
        let missing = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(3));
        let snapshot = DocumentSnapshot::new(key("rooms/a"), Some(missing), true);
        assert!(!snapshot.exists());
        assert!(snapshot.data().is_none());
        assert!(snapshot.metadata().from_cache);
    }

    #[test]
    fn field_lookup_uses_dotted_paths() {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::parse("a.b").unwrap(), Value::Integer(7));
        let doc = MutableDocument::new_found(key("rooms/a"), SnapshotVersion::from_micros(3), data);
        let snapshot = DocumentSnapshot::from_server(doc);
        assert!(snapshot.exists());
        assert_eq!(snapshot.get("a.b"), Some(&Value::Integer(7)));
        assert_eq!(snapshot.get("a.c"), None);
        assert!(!snapshot.metadata().from_cache);
        assert!(!snapshot.metadata().has_pending_writes);
    }
}
