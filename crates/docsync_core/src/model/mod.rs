//! Documents, keys and field values as seen by the local store.

mod document;
mod object_value;
mod path;
mod snapshot_version;

pub use document::{DocumentKeySet, DocumentKind, DocumentMap, DocumentState, MutableDocument};
pub use object_value::{FieldMask, ObjectValue};
pub use path::{DocumentKey, FieldPath, ResourcePath, DOCUMENT_KEY_NAME};
pub use snapshot_version::SnapshotVersion;

/// Identifier of a mutation batch.
pub type BatchId = i32;

/// Identifier of a target.
pub type TargetId = i32;

/// Sequence number recording when a target was last used.
pub type ListenSequenceNumber = i64;

/// Batch id meaning "no batch".
pub const BATCH_ID_UNKNOWN: BatchId = -1;
