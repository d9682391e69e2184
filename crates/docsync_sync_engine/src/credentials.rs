//! Authentication tokens attached to backend requests.

use crate::error::SyncResult;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An opaque access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    /// Token value sent to the backend.
    pub value: String,
    /// User the token belongs to, if any.
    pub user_id: Option<String>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Supplies tokens to the streams and unary calls.
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the current token. `force_refresh` asks for a new token
    /// instead of a cached one.
    fn get_token(&self, force_refresh: bool) -> BoxFuture<'static, SyncResult<Option<Token>>>;

    /// Marks the current token as rejected so the next
    /// [`CredentialsProvider::get_token`] refreshes it.
    fn invalidate_token(&self) {}
}

/// Provider for unauthenticated access.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCredentialsProvider;

impl CredentialsProvider for EmptyCredentialsProvider {
    fn get_token(&self, _force_refresh: bool) -> BoxFuture<'static, SyncResult<Option<Token>>> {
        futures::future::ready(Ok(None)).boxed()
    }
}

/// Provider handing out a fixed token, counting refreshes.
#[derive(Debug)]
pub struct StaticCredentialsProvider {
    token: Token,
    force_refresh: Mutex<bool>,
    refreshes: AtomicUsize,
}

impl StaticCredentialsProvider {
    /// Creates a provider for `token`.
    pub fn new(token: Token) -> Self {
        Self {
            token,
            force_refresh: Mutex::new(false),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Returns how many times a refreshed token was handed out.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn get_token(&self, force_refresh: bool) -> BoxFuture<'static, SyncResult<Option<Token>>> {
        let refresh = std::mem::take(&mut *self.force_refresh.lock()) || force_refresh;
        if refresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        futures::future::ready(Ok(Some(self.token.clone()))).boxed()
    }

    fn invalidate_token(&self) {
        *self.force_refresh.lock() = true;
    }
}
