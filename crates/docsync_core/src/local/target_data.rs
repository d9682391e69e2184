//! Target metadata.

use crate::model::{ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::query::Target;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Why a target is being listened to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular query listener.
    Listen,
    /// Re-listen after an existence filter mismatch without a bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter could not reconcile the mismatch.
    ExistenceFilterMismatchBloom,
    /// A single-document target resolving a limbo document.
    LimboResolution,
}

/// What the local store knows about a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    /// The target.
    pub target: Target,
    /// Id assigned by the local store or the sync engine.
    pub target_id: TargetId,
    /// Purpose of the listen.
    pub purpose: TargetPurpose,
    /// When the target was last used.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot.
    pub snapshot_version: SnapshotVersion,
    /// Last snapshot version at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Token to resume the watch with.
    pub resume_token: Bytes,
    /// Document count expected after resuming, used by existence filters.
    pub expected_count: Option<u32>,
}

impl TargetData {
    /// Creates metadata for a newly allocated target.
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::NONE,
            last_limbo_free_snapshot_version: SnapshotVersion::NONE,
            resume_token: Bytes::new(),
            expected_count: None,
        }
    }

    /// Returns a copy with a new sequence number.
    #[must_use]
    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// Returns a copy with a new resume token and snapshot version. Clears
    /// the expected count.
    #[must_use]
    pub fn with_resume_token(&self, resume_token: Bytes, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    /// Returns a copy with a new expected count.
    #[must_use]
    pub fn with_expected_count(&self, expected_count: Option<u32>) -> Self {
        Self {
            expected_count,
            ..self.clone()
        }
    }

    /// Returns a copy with a new last limbo-free snapshot version.
    #[must_use]
    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    /// Returns a copy with a different purpose.
    #[must_use]
    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
