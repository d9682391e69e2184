//! Transport abstraction between the engine and the backend.
//!
//! A [`Connection`] opens the two long-lived streams and performs the unary
//! calls used by transactions. The engine owns retry, backoff and
//! reconnection; implementations only move messages.

use crate::credentials::Token;
use crate::error::SyncResult;
use docsync_core::{DocumentKey, MutableDocument, Mutation};
use docsync_sync_protocol::{Status, StreamKind, StreamRequest, StreamResponse, WriteResponse};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Something that happened on an open stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A message from the backend.
    Message(StreamResponse),
    /// The stream ended. `None` means a clean close initiated by the
    /// backend.
    Closed(Option<Status>),
}

/// Both directions of an open stream.
///
/// Dropping `outgoing` closes the stream from the client side. When the
/// backend side goes away without a [`StreamEvent::Closed`], the stream is
/// treated as failed with `Unavailable`.
#[derive(Debug)]
pub struct StreamChannel {
    /// Requests to the backend.
    pub outgoing: mpsc::UnboundedSender<StreamRequest>,
    /// Events from the backend.
    pub incoming: mpsc::UnboundedReceiver<StreamEvent>,
}

/// A transport to the backend.
pub trait Connection: Send + Sync + 'static {
    /// Opens a stream of `kind`.
    fn open_stream(&self, kind: StreamKind, token: Option<Token>) -> BoxFuture<'static, SyncResult<StreamChannel>>;

    /// Commits mutations atomically outside the write stream.
    fn commit(
        &self,
        mutations: Vec<Mutation>,
        token: Option<Token>,
    ) -> BoxFuture<'static, SyncResult<WriteResponse>>;

    /// Reads documents directly from the backend. Missing documents come
    /// back as no-documents with the read version.
    fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        token: Option<Token>,
    ) -> BoxFuture<'static, SyncResult<Vec<MutableDocument>>>;
}
