//! Optimistic read-write transactions.
//!
//! A transaction reads documents straight from the backend and records the
//! version of each. Its writes are buffered and sent in one commit, with
//! preconditions that make the commit fail if any read document changed in
//! the meantime. The runner retries the whole closure with backoff when the
//! backend reports contention.

use crate::async_queue::{AsyncQueue, TimerId};
use crate::backoff::ExponentialBackoff;
use crate::client::DocumentSnapshot;
use crate::config::BackoffConfig;
use crate::connection::Connection;
use crate::credentials::CredentialsProvider;
use crate::error::{SyncError, SyncResult};
use crate::user_data::{parse_set, parse_update, DocumentData, SetOptions};
use docsync_core::{DocumentKey, MutableDocument, Mutation, Precondition, SnapshotVersion};
use docsync_sync_protocol::Code;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct TransactionState {
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    written_docs: BTreeSet<DocumentKey>,
    mutations: Vec<Mutation>,
    last_error: Option<SyncError>,
    committed: bool,
}

impl TransactionState {
    fn ensure_open(&self) -> SyncResult<()> {
        if self.committed {
            return Err(SyncError::validation("the transaction has already been committed"));
        }
        Ok(())
    }

    fn record_version(&mut self, doc: &MutableDocument) -> SyncResult<()> {
        let version = if doc.is_found_document() {
            doc.version()
        } else if doc.is_no_document() {
            SnapshotVersion::NONE
        } else {
            return Err(SyncError::Fatal(format!(
                "transaction read returned an unexpected document for {}",
                doc.key()
            )));
        };
        match self.read_versions.get(doc.key()) {
            Some(existing) if *existing != version => Err(SyncError::backend(
                Code::Aborted,
                format!("document {} changed between two reads", doc.key()),
            )),
            Some(_) => Ok(()),
            None => {
                self.read_versions.insert(doc.key().clone(), version);
                Ok(())
            }
        }
    }

    /// Precondition for a set or delete of a document read earlier.
    fn precondition(&self, key: &DocumentKey) -> Precondition {
        match self.read_versions.get(key) {
            Some(version) if version.is_none() => Precondition::Exists(false),
            Some(version) => Precondition::UpdateTime(*version),
            None => Precondition::None,
        }
    }

    fn precondition_for_update(&self, key: &DocumentKey) -> SyncResult<Precondition> {
        match self.read_versions.get(key) {
            Some(version) if version.is_none() => Err(SyncError::validation(format!(
                "cannot update {key}: the document does not exist"
            ))),
            Some(version) => Ok(Precondition::UpdateTime(*version)),
            None => Ok(Precondition::Exists(true)),
        }
    }

    fn push(&mut self, mutation: Mutation) {
        self.written_docs.insert(mutation.key().clone());
        self.mutations.push(mutation);
    }
}

/// A handle to a running transaction. Clones share the same state.
#[derive(Clone)]
pub struct Transaction {
    state: Arc<Mutex<TransactionState>>,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("state", &*self.state.lock()).finish()
    }
}

impl Transaction {
    fn new(connection: Arc<dyn Connection>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransactionState::default())),
            connection,
            credentials,
        }
    }

    /// Reads a document from the backend.
    ///
    /// All reads must happen before the first write.
    pub async fn get(&self, path: &str) -> SyncResult<DocumentSnapshot> {
        let key = DocumentKey::parse(path)?;
        let mut docs = self.lookup(vec![key]).await?;
        docs.pop()
            .map(DocumentSnapshot::from_server)
            .ok_or_else(|| SyncError::transport_retryable("batch read returned no document"))
    }

    async fn lookup(&self, keys: Vec<DocumentKey>) -> SyncResult<Vec<MutableDocument>> {
        {
            let state = self.state.lock();
            state.ensure_open()?;
            if !state.mutations.is_empty() {
                return Err(SyncError::validation(
                    "all reads in a transaction must happen before any write",
                ));
            }
        }
        let result = self.read_from_backend(keys).await;
        let mut state = self.state.lock();
        let docs = match result {
            Ok(docs) => docs,
            Err(e) => {
                state.last_error = Some(e.duplicate());
                return Err(e);
            }
        };
        for doc in &docs {
            if let Err(e) = state.record_version(doc) {
                state.last_error = Some(e.duplicate());
                return Err(e);
            }
        }
        Ok(docs)
    }

    async fn read_from_backend(&self, keys: Vec<DocumentKey>) -> SyncResult<Vec<MutableDocument>> {
        let token = self.credentials.get_token(false).await?;
        self.connection.batch_get_documents(keys, token).await
    }

    /// Writes a document.
    pub fn set(&self, path: &str, data: DocumentData, options: SetOptions) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        let precondition = state.precondition(&key);
        let mutation = parse_set(key, &data, &options)?.with_precondition(precondition);
        state.push(mutation);
        Ok(())
    }

    /// Updates fields of an existing document.
    pub fn update(&self, path: &str, data: DocumentData) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        let precondition = state.precondition_for_update(&key)?;
        let mutation = parse_update(key, &data)?.with_precondition(precondition);
        state.push(mutation);
        Ok(())
    }

    /// Deletes a document.
    pub fn delete(&self, path: &str) -> SyncResult<()> {
        let key = DocumentKey::parse(path)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        let precondition = state.precondition(&key);
        state.push(Mutation::delete(key).with_precondition(precondition));
        Ok(())
    }

    async fn commit(&self) -> SyncResult<()> {
        let mutations = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if let Some(e) = state.last_error.take() {
                return Err(e);
            }
            // Documents that were read but not written must still be
            // unchanged at commit time.
            let unwritten: Vec<Mutation> = state
                .read_versions
                .iter()
                .filter(|(key, _)| !state.written_docs.contains(*key))
                .map(|(key, version)| Mutation::verify(key.clone(), *version))
                .collect();
            state.committed = true;
            let mut mutations = std::mem::take(&mut state.mutations);
            mutations.extend(unwritten);
            mutations
        };
        if mutations.is_empty() {
            return Ok(());
        }
        let token = self.credentials.get_token(false).await?;
        let response = self.connection.commit(mutations, token).await?;
        debug!(commit_version = %response.commit_version, "transaction committed");
        Ok(())
    }
}

/// Runs a transaction closure until it commits or fails for good.
pub(crate) struct TransactionRunner {
    queue: AsyncQueue,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    backoff: ExponentialBackoff,
    max_attempts: u32,
}

impl TransactionRunner {
    pub(crate) fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        backoff: BackoffConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            connection,
            credentials,
            backoff: ExponentialBackoff::new(backoff, TimerId::TransactionRetry),
            max_attempts: max_attempts.max(1),
        }
    }

    pub(crate) async fn run<T, F, Fut>(mut self, mut update: F) -> SyncResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempts_remaining = self.max_attempts;
        loop {
            attempts_remaining -= 1;
            self.wait_for_backoff().await?;

            let transaction = Transaction::new(Arc::clone(&self.connection), Arc::clone(&self.credentials));
            let result = match update(transaction.clone()).await {
                Ok(value) => transaction.commit().await.map(|()| value),
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempts_remaining > 0 && is_retryable_transaction_error(&e) => {
                    warn!(error = %e, attempts_remaining, "transaction failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wait_for_backoff(&mut self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.backoff.backoff_and_run(&self.queue, async move {
            let _ = tx.send(());
        });
        rx.await.map_err(|_| SyncError::Terminated)
    }
}

fn is_retryable_transaction_error(error: &SyncError) -> bool {
    match error {
        SyncError::Backend(status) => {
            matches!(status.code, Code::Aborted | Code::FailedPrecondition | Code::AlreadyExists)
                || !status.code.is_permanent_error()
        }
        other => other.is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::ObjectValue;
    use docsync_sync_protocol::Status;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn found(path: &str, version: i64) -> MutableDocument {
        MutableDocument::new_found(key(path), SnapshotVersion::from_micros(version), ObjectValue::empty())
    }

    #[test]
    fn repeated_reads_must_agree() {
        let mut state = TransactionState::default();
        state.record_version(&found("a/1", 5)).unwrap();
        state.record_version(&found("a/1", 5)).unwrap();
        let err = state.record_version(&found("a/1", 6)).unwrap_err();
        assert_eq!(err.code(), Some(Code::Aborted));
    }

    #[test]
    fn preconditions_follow_read_versions() {
        let mut state = TransactionState::default();
        state.record_version(&found("a/1", 5)).unwrap();
        state
            .record_version(&MutableDocument::new_no_document(key("a/2"), SnapshotVersion::NONE))
            .unwrap();

        assert_eq!(state.precondition(&key("a/1")), Precondition::UpdateTime(SnapshotVersion::from_micros(5)));
        assert_eq!(state.precondition(&key("a/2")), Precondition::Exists(false));
        assert_eq!(state.precondition(&key("a/3")), Precondition::None);

        assert!(state.precondition_for_update(&key("a/2")).is_err());
        assert_eq!(state.precondition_for_update(&key("a/3")).unwrap(), Precondition::Exists(true));
    }

    #[test]
    fn contention_errors_are_retryable() {
        for code in [Code::Aborted, Code::FailedPrecondition, Code::AlreadyExists, Code::Unavailable] {
            assert!(is_retryable_transaction_error(&SyncError::Backend(Status::new(code, "x"))));
        }
        assert!(!is_retryable_transaction_error(&SyncError::backend(Code::PermissionDenied, "no")));
        assert!(!is_retryable_transaction_error(&SyncError::validation("bad")));
    }
}
