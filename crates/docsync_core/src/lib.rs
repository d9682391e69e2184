//! # docsync Core
//!
//! Data model and local store for the docsync engine.
//!
//! This crate provides:
//! - Persistent sorted collections ([`SortedMap`], [`SortedSet`]) with O(1)
//!   snapshots
//! - Documents, paths and field values
//! - Mutations, batches and overlays
//! - Queries, targets and their matching rules
//! - The [`LocalStore`]: remote document cache, mutation queue, target
//!   cache, query engine and eager garbage collection over a
//!   [`KvStore`](docsync_storage::KvStore)
//!
//! ## Example
//!
//! ```
//! use docsync_core::SortedMap;
//!
//! let empty: SortedMap<i32, &str> = SortedMap::new();
//! let one = empty.insert(1, "one");
//! let two = one.insert(2, "two");
//!
//! assert!(empty.is_empty());
//! assert_eq!(one.len(), 1);
//! assert_eq!(two.get(&2), Some(&"two"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collections;
mod config;
mod error;
mod local;
mod model;
mod mutation;
mod query;
mod remote_event;

pub use collections::{Comparator, Iter, Natural, SetIter, SortedMap, SortedSet};
pub use config::{DeviceClass, LocalStoreConfig, QueryEngineConfig};
pub use error::{CoreError, CoreResult};
pub use local::{
    FieldIndex, LocalStore, LocalViewChanges, LocalWriteResult, Persistence, QueryEngine,
    QueryResult, QueryStrategy, ReferenceSet, TargetData, TargetIdGenerator, TargetPurpose,
};
pub use model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentKind, DocumentMap, DocumentState, FieldMask,
    FieldPath, ListenSequenceNumber, MutableDocument, ObjectValue, ResourcePath, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN, DOCUMENT_KEY_NAME,
};
pub use mutation::{
    calculate_overlay_mutation, FieldTransform, Mutation, MutationBatch, MutationBatchResult,
    MutationKind, MutationResult, Overlay, OverlayedDocument, Precondition, TransformOperation,
};
pub use query::{
    field_filter, Bound, Direction, DocumentComparator, FieldFilter, LimitType, Operator, OrderBy,
    Query, Target,
};
pub use remote_event::{RemoteEvent, TargetChange};

pub use docsync_codec::{Timestamp, Value};
