//! Snapshot versions.

use docsync_codec::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A server-assigned logical version.
///
/// `SnapshotVersion::NONE` marks a document or target that has never been
/// confirmed by the backend.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    /// The version that precedes every real version.
    pub const NONE: SnapshotVersion = SnapshotVersion(Timestamp::MIN);

    /// Wraps a timestamp.
    pub const fn from_timestamp(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Creates a version from microseconds since the epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    /// Returns the wrapped timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    /// Returns the version in microseconds since the epoch.
    pub fn to_micros(&self) -> i64 {
        self.0.to_micros()
    }

    /// Returns true for [`SnapshotVersion::NONE`].
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}
