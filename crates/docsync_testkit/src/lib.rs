//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - A scripted in-process backend implementing the engine's `Connection`
//! - Fixtures for keys, documents, queries and fast engine configs
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn listens() {
//!     let (connection, mut backend) = mock_backend();
//!     let store = open_store(connection);
//!     let mut snapshots = store.snapshots(query("rooms"), ListenOptions::default());
//!     let mut listen = backend.next_listen_stream().await;
//!     // ... drive the stream
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mock;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::mock::*;
}

pub use fixtures::*;
pub use generators::*;
pub use mock::*;
