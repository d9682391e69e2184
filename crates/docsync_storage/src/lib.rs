//! # docsync Storage
//!
//! Storage collaborator boundary for the docsync engine.
//!
//! The engine persists documents, mutation batches, overlays, and target
//! metadata through a **transactional key-range store**. The store is an
//! opaque ordered byte map; it does not interpret keys or values.
//!
//! ## Design Principles
//!
//! - Stores are ordered byte maps (get, prefix scan, atomic batch commit)
//! - A [`WriteBatch`] is applied all-or-nothing
//! - No knowledge of documents, batches, or targets
//! - Must be `Send + Sync`
//! - A store may report itself [`StorageError::Unavailable`]; the engine then
//!   runs memory-only
//!
//! ## Available Stores
//!
//! - [`MemoryKvStore`] - For testing and ephemeral engines
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{KvStore, MemoryKvStore, WriteBatch};
//!
//! let store = MemoryKvStore::new();
//! let mut batch = WriteBatch::new();
//! batch.put(b"doc/users/1".to_vec(), b"ann".to_vec());
//! store.commit(batch).unwrap();
//! assert_eq!(store.get(b"doc/users/1").unwrap(), Some(b"ann".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;

pub use backend::{KvStore, WriteBatch, WriteOp};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryKvStore;
