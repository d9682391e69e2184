//! Requests and responses of the listen and write streams.

use crate::watch::WatchChange;
use bytes::Bytes;
use docsync_core::{Mutation, MutationResult, SnapshotVersion, Target, TargetData, TargetId};

/// The two long-lived streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Target registrations in, watch changes out.
    Listen,
    /// Mutation batches in, acknowledgements out.
    Write,
}

/// Registration of a target on the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRequest {
    /// Client-assigned target id.
    pub target_id: TargetId,
    /// What to listen to.
    pub target: Target,
    /// Resume token from the previous listen, or empty.
    pub resume_token: Bytes,
    /// Version to resume from when there is no token.
    pub read_time: SnapshotVersion,
    /// Number of documents the client expects, sent only when resuming.
    pub expected_count: Option<u32>,
}

impl TargetRequest {
    /// Builds the registration for `data`, resuming from its token or, if it
    /// has none, from its snapshot version.
    pub fn from_target_data(data: &TargetData) -> Self {
        let resuming = !data.resume_token.is_empty() || !data.snapshot_version.is_none();
        Self {
            target_id: data.target_id,
            target: data.target.clone(),
            resume_token: data.resume_token.clone(),
            read_time: if data.resume_token.is_empty() {
                data.snapshot_version
            } else {
                SnapshotVersion::NONE
            },
            expected_count: data.expected_count.filter(|_| resuming),
        }
    }

    /// Returns true if the backend may send only changes since a previous
    /// listen.
    pub fn is_resume(&self) -> bool {
        !self.resume_token.is_empty() || !self.read_time.is_none()
    }
}

/// A message sent on the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    /// Start listening to a target.
    AddTarget(TargetRequest),
    /// Stop listening to a target.
    RemoveTarget(TargetId),
}

/// A message sent on the write stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// First message on a new stream; the response carries the stream token.
    Handshake,
    /// A batch of mutations to commit atomically.
    Mutations {
        /// Token from the most recent response.
        stream_token: Bytes,
        /// The batch's mutations.
        mutations: Vec<Mutation>,
    },
}

/// A message received on the write stream.
///
/// The handshake response carries only a stream token. Every later response
/// acknowledges the oldest unacknowledged batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    /// Token to send with the next request.
    pub stream_token: Bytes,
    /// Version at which the batch committed.
    pub commit_version: SnapshotVersion,
    /// One result per mutation.
    pub mutation_results: Vec<MutationResult>,
}

impl WriteResponse {
    /// A handshake response.
    pub fn handshake(stream_token: Bytes) -> Self {
        Self {
            stream_token,
            commit_version: SnapshotVersion::NONE,
            mutation_results: Vec::new(),
        }
    }
}

/// Any message sent on a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    /// A listen stream message.
    Listen(ListenRequest),
    /// A write stream message.
    Write(WriteRequest),
}

/// Any message received on a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamResponse {
    /// A listen stream message.
    Listen(WatchChange),
    /// A write stream message.
    Write(WriteResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{Query, TargetPurpose};

    fn target_data() -> TargetData {
        let target = Query::collection("rooms").unwrap().to_target();
        TargetData::new(target, 2, TargetPurpose::Listen, 1)
    }

    #[test]
    fn fresh_target_is_not_a_resume() {
        let request = TargetRequest::from_target_data(&target_data().with_expected_count(Some(3)));
        assert!(!request.is_resume());
        assert_eq!(request.expected_count, None);
    }

    #[test]
    fn resume_token_wins_over_read_time() {
        let data = target_data()
            .with_resume_token(Bytes::from_static(b"tok"), SnapshotVersion::from_micros(9))
            .with_expected_count(Some(3));
        let request = TargetRequest::from_target_data(&data);
        assert!(request.is_resume());
        assert_eq!(request.resume_token, Bytes::from_static(b"tok"));
        assert!(request.read_time.is_none());
        assert_eq!(request.expected_count, Some(3));
    }
}
