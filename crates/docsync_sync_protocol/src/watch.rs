//! Changes delivered on the listen stream.

use crate::bloom_filter::BloomFilterParams;
use crate::status::Status;
use bytes::Bytes;
use docsync_core::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// One message on the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    /// A document was added to, changed in, or removed from targets.
    Document(DocumentChange),
    /// The state of targets changed.
    Target(WatchTargetChange),
    /// The backend's count of documents matching a target.
    ExistenceFilter(ExistenceFilterChange),
}

/// A document entering, changing within or leaving targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Targets the document now matches.
    pub updated_target_ids: Vec<TargetId>,
    /// Targets the document no longer matches.
    pub removed_target_ids: Vec<TargetId>,
    /// Key of the document.
    pub key: DocumentKey,
    /// New state of the document; `None` when it only left targets.
    pub new_doc: Option<MutableDocument>,
}

impl DocumentChange {
    /// A document that now matches `targets`.
    pub fn updated(doc: MutableDocument, targets: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: targets,
            removed_target_ids: Vec::new(),
            key: doc.key().clone(),
            new_doc: Some(doc),
        }
    }

    /// A document that was deleted while matching `targets`.
    pub fn deleted(key: DocumentKey, version: SnapshotVersion, targets: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: targets,
            new_doc: Some(MutableDocument::new_no_document(key.clone(), version)),
            key,
        }
    }

    /// A document that stopped matching `targets` but still exists.
    pub fn removed(key: DocumentKey, targets: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: targets,
            key,
            new_doc: None,
        }
    }
}

/// What happened to the targets of a [`WatchTargetChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    /// Only the resume token or read time moved.
    NoChange,
    /// The targets were added.
    Added,
    /// The targets were removed, possibly with an error cause.
    Removed,
    /// The targets are consistent with the read time.
    Current,
    /// The targets' documents must be re-sent from scratch.
    Reset,
}

/// A change to the state of a set of targets.
///
/// A change with no target ids applies to every active target. A
/// `NoChange` for all targets with a read time marks a consistent snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    /// What happened.
    pub state: WatchTargetChangeState,
    /// Affected targets, or empty for all.
    pub target_ids: Vec<TargetId>,
    /// Token to resume the targets from.
    pub resume_token: Bytes,
    /// Version the change is consistent at, if any.
    pub read_time: SnapshotVersion,
    /// Why the targets were removed.
    pub cause: Option<Status>,
}

impl WatchTargetChange {
    /// Creates a change without token or read time.
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Bytes::new(),
            read_time: SnapshotVersion::NONE,
            cause: None,
        }
    }

    /// Sets the resume token.
    #[must_use]
    pub fn with_resume_token(mut self, token: Bytes) -> Self {
        self.resume_token = token;
        self
    }

    /// Sets the read time.
    #[must_use]
    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    /// Sets the removal cause.
    #[must_use]
    pub fn with_cause(mut self, cause: Status) -> Self {
        self.cause = Some(cause);
        self
    }

    /// A global snapshot marker at `read_time`.
    pub fn snapshot(read_time: SnapshotVersion, resume_token: Bytes) -> Self {
        Self::new(WatchTargetChangeState::NoChange, Vec::new())
            .with_read_time(read_time)
            .with_resume_token(resume_token)
    }
}

/// The backend's count of documents matching a target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExistenceFilter {
    /// Number of documents matching the target.
    pub count: u32,
    /// Names of the matching documents, if the backend sent them.
    pub unchanged_names: Option<BloomFilterParams>,
}

impl ExistenceFilter {
    /// A filter with only a count.
    pub fn with_count(count: u32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }
}

/// An existence filter for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    /// Target the filter applies to.
    pub target_id: TargetId,
    /// The filter.
    pub filter: ExistenceFilter,
}
