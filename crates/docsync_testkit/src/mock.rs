//! Scripted backend for driving the engine in tests.
//!
//! [`mock_backend`] returns a [`MockConnection`] to hand to the store and a
//! [`MockBackend`] the test holds. Every stream the engine opens shows up
//! on the backend as a [`MockStream`], through which the test reads the
//! engine's requests and plays the backend's responses.

use bytes::Bytes;
use docsync_core::{DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion};
use docsync_sync_engine::{Connection, StreamChannel, StreamEvent, SyncError, SyncResult, Token};
use docsync_sync_protocol::{
    ListenRequest, Status, StreamKind, StreamRequest, StreamResponse, WatchChange, WriteRequest,
    WriteResponse,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long the backend waits for the engine before failing the test.
pub const MOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct BackendState {
    open_failures: VecDeque<Status>,
    open_tokens: Vec<Option<Token>>,
    commit_responses: VecDeque<Result<(), Status>>,
    commits: Vec<Vec<Mutation>>,
    documents: BTreeMap<DocumentKey, MutableDocument>,
    version: i64,
}

impl BackendState {
    fn next_version(&mut self) -> SnapshotVersion {
        self.version += 1;
        SnapshotVersion::from_micros(self.version)
    }
}

/// The engine's side of the mock backend.
pub struct MockConnection {
    state: Mutex<BackendState>,
    listen_streams: mpsc::UnboundedSender<MockStream>,
    write_streams: mpsc::UnboundedSender<MockStream>,
}

/// The test's side of the mock backend.
pub struct MockBackend {
    listen_streams: mpsc::UnboundedReceiver<MockStream>,
    write_streams: mpsc::UnboundedReceiver<MockStream>,
}

/// Creates a connected mock backend.
pub fn mock_backend() -> (Arc<MockConnection>, MockBackend) {
    let (listen_tx, listen_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(MockConnection {
        state: Mutex::new(BackendState::default()),
        listen_streams: listen_tx,
        write_streams: write_tx,
    });
    let backend = MockBackend {
        listen_streams: listen_rx,
        write_streams: write_rx,
    };
    (connection, backend)
}

impl MockConnection {
    /// Makes the next stream open fail with `status`.
    pub fn fail_next_open(&self, status: Status) {
        self.state.lock().open_failures.push_back(status);
    }

    /// Scripts the outcome of the next unary commit. Unscripted commits
    /// succeed.
    pub fn push_commit_response(&self, response: Result<(), Status>) {
        self.state.lock().commit_responses.push_back(response);
    }

    /// Stores a document served by batch reads.
    pub fn set_document(&self, doc: MutableDocument) {
        let mut state = self.state.lock();
        if doc.version().to_micros() > state.version {
            state.version = doc.version().to_micros();
        }
        state.documents.insert(doc.key().clone(), doc);
    }

    /// Returns every unary commit received, including failed ones.
    pub fn commits(&self) -> Vec<Vec<Mutation>> {
        self.state.lock().commits.clone()
    }

    /// Returns the token of every stream open attempt.
    pub fn open_tokens(&self) -> Vec<Option<Token>> {
        self.state.lock().open_tokens.clone()
    }
}

impl Connection for MockConnection {
    fn open_stream(&self, kind: StreamKind, token: Option<Token>) -> BoxFuture<'static, SyncResult<StreamChannel>> {
        let mut state = self.state.lock();
        state.open_tokens.push(token);
        if let Some(status) = state.open_failures.pop_front() {
            return futures::future::ready(Err(SyncError::Backend(status))).boxed();
        }
        drop(state);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stream = MockStream {
            kind,
            requests: request_rx,
            events: event_tx,
        };
        let registered = match kind {
            StreamKind::Listen => self.listen_streams.send(stream),
            StreamKind::Write => self.write_streams.send(stream),
        };
        let result = match registered {
            Ok(()) => Ok(StreamChannel {
                outgoing: request_tx,
                incoming: event_rx,
            }),
            Err(_) => Err(SyncError::transport_retryable("mock backend dropped")),
        };
        futures::future::ready(result).boxed()
    }

    fn commit(&self, mutations: Vec<Mutation>, _token: Option<Token>) -> BoxFuture<'static, SyncResult<WriteResponse>> {
        let mut state = self.state.lock();
        let count = mutations.len();
        state.commits.push(mutations);
        let result = match state.commit_responses.pop_front() {
            Some(Err(status)) => Err(SyncError::Backend(status)),
            Some(Ok(())) | None => {
                let version = state.next_version();
                Ok(WriteResponse {
                    stream_token: Bytes::new(),
                    commit_version: version,
                    mutation_results: vec![MutationResult::new(version); count],
                })
            }
        };
        futures::future::ready(result).boxed()
    }

    fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        _token: Option<Token>,
    ) -> BoxFuture<'static, SyncResult<Vec<MutableDocument>>> {
        let state = self.state.lock();
        let read_version = SnapshotVersion::from_micros(state.version.max(1));
        let docs = keys
            .into_iter()
            .map(|key| match state.documents.get(&key) {
                Some(doc) => doc.clone(),
                None => MutableDocument::new_no_document(key, read_version),
            })
            .collect();
        futures::future::ready(Ok(docs)).boxed()
    }
}

impl MockBackend {
    /// Waits for the engine to open a listen stream.
    ///
    /// # Panics
    ///
    /// Panics if no stream opens within [`MOCK_TIMEOUT`].
    pub async fn next_listen_stream(&mut self) -> MockStream {
        recv_within(&mut self.listen_streams, "listen stream").await
    }

    /// Waits for the engine to open a write stream.
    ///
    /// # Panics
    ///
    /// Panics if no stream opens within [`MOCK_TIMEOUT`].
    pub async fn next_write_stream(&mut self) -> MockStream {
        recv_within(&mut self.write_streams, "write stream").await
    }

    /// Returns a listen stream the engine already opened, if any.
    pub fn try_next_listen_stream(&mut self) -> Option<MockStream> {
        self.listen_streams.try_recv().ok()
    }

    /// Returns a write stream the engine already opened, if any.
    pub fn try_next_write_stream(&mut self) -> Option<MockStream> {
        self.write_streams.try_recv().ok()
    }
}

/// One stream opened by the engine.
pub struct MockStream {
    kind: StreamKind,
    requests: mpsc::UnboundedReceiver<StreamRequest>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl std::fmt::Debug for MockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStream").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl MockStream {
    /// Returns the stream's kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Waits for the engine's next request.
    ///
    /// # Panics
    ///
    /// Panics if the engine closes the stream or sends nothing within
    /// [`MOCK_TIMEOUT`].
    pub async fn next_request(&mut self) -> StreamRequest {
        recv_within(&mut self.requests, "stream request").await
    }

    /// Returns a request the engine already sent, if any.
    pub fn try_next_request(&mut self) -> Option<StreamRequest> {
        self.requests.try_recv().ok()
    }

    /// Waits for the next listen request.
    ///
    /// # Panics
    ///
    /// Panics if the next request is not a listen request.
    pub async fn next_listen_request(&mut self) -> ListenRequest {
        match self.next_request().await {
            StreamRequest::Listen(request) => request,
            other => panic!("expected a listen request, got {other:?}"),
        }
    }

    /// Waits for the next write request.
    ///
    /// # Panics
    ///
    /// Panics if the next request is not a write request.
    pub async fn next_write_request(&mut self) -> WriteRequest {
        match self.next_request().await {
            StreamRequest::Write(request) => request,
            other => panic!("expected a write request, got {other:?}"),
        }
    }

    /// Waits for the next batch of mutations on a write stream.
    ///
    /// # Panics
    ///
    /// Panics if the next request is not a mutation batch.
    pub async fn next_mutations(&mut self) -> Vec<Mutation> {
        match self.next_write_request().await {
            WriteRequest::Mutations { mutations, .. } => mutations,
            other => panic!("expected mutations, got {other:?}"),
        }
    }

    /// Waits until the engine closes its side of the stream.
    ///
    /// # Panics
    ///
    /// Panics if a request arrives first or the stream stays open past
    /// [`MOCK_TIMEOUT`].
    pub async fn wait_for_close(&mut self) {
        match tokio::time::timeout(MOCK_TIMEOUT, self.requests.recv()).await {
            Ok(None) => {}
            Ok(Some(request)) => panic!("expected the stream to close, got {request:?}"),
            Err(_) => panic!("stream was not closed within {MOCK_TIMEOUT:?}"),
        }
    }

    /// Sends a watch change.
    pub fn send_watch(&self, change: WatchChange) {
        self.send(StreamEvent::Message(StreamResponse::Listen(change)));
    }

    /// Sends a write response.
    pub fn send_write(&self, response: WriteResponse) {
        self.send(StreamEvent::Message(StreamResponse::Write(response)));
    }

    /// Completes the write stream handshake.
    pub fn ack_handshake(&self, stream_token: &'static [u8]) {
        self.send_write(WriteResponse::handshake(Bytes::from_static(stream_token)));
    }

    /// Acknowledges the oldest batch of `mutation_count` mutations at
    /// `version`.
    pub fn ack_write(&self, version: i64, mutation_count: usize) {
        let version = SnapshotVersion::from_micros(version);
        self.send_write(WriteResponse {
            stream_token: Bytes::from(format!("token-{}", version.to_micros())),
            commit_version: version,
            mutation_results: vec![MutationResult::new(version); mutation_count],
        });
    }

    /// Ends the stream from the backend side.
    pub fn close(self, status: Option<Status>) {
        self.send(StreamEvent::Closed(status));
    }

    fn send(&self, event: StreamEvent) {
        // The engine may already have dropped the stream.
        let _ = self.events.send(event);
    }
}

async fn recv_within<T>(receiver: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    match tokio::time::timeout(MOCK_TIMEOUT, receiver.recv()).await {
        Ok(Some(item)) => item,
        Ok(None) => panic!("{what} channel closed"),
        Err(_) => panic!("no {what} within {MOCK_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{doc, key};
    use docsync_sync_protocol::Code;

    #[tokio::test]
    async fn batch_get_serves_stored_and_missing_documents() {
        let (connection, _backend) = mock_backend();
        connection.set_document(doc("rooms/a", 7, &[]));

        let docs = connection
            .batch_get_documents(vec![key("rooms/a"), key("rooms/b")], None)
            .await
            .unwrap();
        assert!(docs[0].is_found_document());
        assert!(docs[1].is_no_document());
        assert_eq!(docs[1].version(), SnapshotVersion::from_micros(7));
    }

    #[tokio::test]
    async fn scripted_commit_failures_come_first() {
        let (connection, _backend) = mock_backend();
        connection.push_commit_response(Err(Status::new(Code::Aborted, "contention")));

        let err = connection.commit(vec![], None).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::Aborted));
        assert!(connection.commit(vec![], None).await.is_ok());
        assert_eq!(connection.commits().len(), 2);
    }

    #[tokio::test]
    async fn opened_streams_reach_the_backend() {
        let (connection, mut backend) = mock_backend();
        connection.fail_next_open(Status::new(Code::Unavailable, "down"));
        assert!(connection.open_stream(StreamKind::Listen, None).await.is_err());

        let channel = connection.open_stream(StreamKind::Listen, None).await.unwrap();
        let mut stream = backend.next_listen_stream().await;
        channel
            .outgoing
            .send(StreamRequest::Listen(ListenRequest::RemoveTarget(2)))
            .unwrap();
        assert_eq!(stream.next_listen_request().await, ListenRequest::RemoveTarget(2));
        assert_eq!(connection.open_tokens().len(), 2);
    }
}
