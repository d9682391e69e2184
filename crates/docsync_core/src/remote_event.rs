//! Consolidated watch results handed to the local store.

use crate::local::TargetPurpose;
use crate::model::{DocumentKeySet, DocumentMap, SnapshotVersion, TargetId};
use bytes::Bytes;
use std::collections::BTreeMap;

/// The changes to one target's result set within a remote event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Latest resume token of the target. Empty if the backend sent none.
    pub resume_token: Bytes,
    /// Whether the target is in sync with the backend at the event version.
    pub current: bool,
    /// Keys that entered the result set.
    pub added_documents: DocumentKeySet,
    /// Keys whose documents changed while staying in the result set.
    pub modified_documents: DocumentKeySet,
    /// Keys that left the result set.
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// Creates a change that only marks the target current.
    pub fn current_with_token(resume_token: Bytes) -> Self {
        Self {
            resume_token,
            current: true,
            ..Self::default()
        }
    }

    /// Returns the number of document changes.
    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}

/// A consistent snapshot of watch changes at one version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    /// Version the event brings the cache to.
    pub snapshot_version: SnapshotVersion,
    /// Per-target result set changes.
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match and that must be
    /// re-listened without a resume token.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    /// Documents that changed.
    pub document_updates: DocumentMap,
    /// Keys only referenced by limbo targets whose state is now known.
    pub resolved_limbo_documents: DocumentKeySet,
}
