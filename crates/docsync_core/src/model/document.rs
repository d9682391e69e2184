//! Cached documents.

use super::object_value::ObjectValue;
use super::path::{DocumentKey, FieldPath};
use super::snapshot_version::SnapshotVersion;
use crate::collections::{SortedMap, SortedSet};
use docsync_codec::Value;
use serde::{Deserialize, Serialize};

/// What is known about a document's existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Nothing is known; the placeholder for a cache miss.
    Invalid,
    /// The document exists with the given data.
    Found {
        /// Document fields.
        data: ObjectValue,
    },
    /// The document is known not to exist at its version.
    NoDocument,
    /// The document exists but its contents are unknown, e.g. after a patch
    /// was acknowledged for a document that was not cached.
    Unknown,
}

/// Whether the cached document reflects writes the backend has not
/// confirmed yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentState {
    /// The document matches the backend.
    #[default]
    Synced,
    /// Local writes are applied on top of the backend version.
    HasLocalMutations,
    /// A write was acknowledged but the matching watch update has not
    /// arrived.
    HasCommittedMutations,
}

/// A document in the local cache or a local view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableDocument {
    key: DocumentKey,
    kind: DocumentKind,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    state: DocumentState,
}

impl MutableDocument {
    /// Creates a placeholder for a document that is not cached.
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            kind: DocumentKind::Invalid,
            version: SnapshotVersion::NONE,
            read_time: SnapshotVersion::NONE,
            create_time: SnapshotVersion::NONE,
            state: DocumentState::Synced,
        }
    }

    /// Creates an existing document.
    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_found(version, data);
        doc
    }

    /// Creates a document known to be missing.
    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    /// Creates a document whose contents are unknown.
    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_unknown(version);
        doc
    }

    /// Turns this document into an existing one.
    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: ObjectValue) -> &mut Self {
        if self.create_time.is_none() && !self.is_found_document() {
            self.create_time = version;
        }
        self.kind = DocumentKind::Found { data };
        self.version = version;
        self.state = DocumentState::Synced;
        self
    }

    /// Turns this document into a deletion marker.
    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.kind = DocumentKind::NoDocument;
        self.version = version;
        self.create_time = SnapshotVersion::NONE;
        self.state = DocumentState::Synced;
        self
    }

    /// Turns this document into an unknown document.
    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.kind = DocumentKind::Unknown;
        self.version = version;
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as carrying acknowledged but unobserved writes.
    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as carrying local writes.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self
    }

    /// Sets the time the document was read from the backend.
    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    /// Returns the key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Returns the existence kind.
    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    /// Returns the version of the last backend change.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// Returns the time the document was read.
    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    /// Returns the creation version, if known.
    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    /// Returns the local-write state.
    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Returns the document data for found documents.
    pub fn data(&self) -> Option<&ObjectValue> {
        match &self.kind {
            DocumentKind::Found { data } => Some(data),
            _ => None,
        }
    }

    /// Returns the value at `path` for found documents.
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.data().and_then(|d| d.field(path))
    }

    /// Returns the value at `path`, resolving the key pseudo-field.
    pub fn field_value(&self, path: &FieldPath) -> Option<Value> {
        if path.is_key_field() {
            return Some(Value::Reference(self.key.to_string()));
        }
        self.field(path).cloned()
    }

    /// Returns true unless this is an invalid placeholder.
    pub fn is_valid_document(&self) -> bool {
        !matches!(self.kind, DocumentKind::Invalid)
    }

    /// Returns true if the document exists.
    pub fn is_found_document(&self) -> bool {
        matches!(self.kind, DocumentKind::Found { .. })
    }

    /// Returns true if the document is a deletion marker.
    pub fn is_no_document(&self) -> bool {
        matches!(self.kind, DocumentKind::NoDocument)
    }

    /// Returns true if the contents are unknown.
    pub fn is_unknown_document(&self) -> bool {
        matches!(self.kind, DocumentKind::Unknown)
    }

    /// Returns true if local writes are applied.
    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    /// Returns true if acknowledged writes await their watch update.
    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    /// Returns true if the document is not fully confirmed by the backend.
    pub fn has_pending_writes(&self) -> bool {
        self.state != DocumentState::Synced
    }
}

/// Documents keyed by document key.
pub type DocumentMap = SortedMap<DocumentKey, MutableDocument>;

/// A set of document keys.
pub type DocumentKeySet = SortedSet<DocumentKey>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn kinds_are_exclusive() {
        let found = MutableDocument::new_found(
            key("users/1"),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_pairs([("name", Value::from("Ann"))]),
        );
        assert!(found.is_found_document());
        assert!(!found.is_no_document());
        assert_eq!(
            found.field(&FieldPath::parse("name").unwrap()),
            Some(&Value::from("Ann"))
        );

        let missing = MutableDocument::new_no_document(key("users/2"), SnapshotVersion::NONE);
        assert!(missing.is_valid_document());
        assert!(missing.data().is_none());

        let invalid = MutableDocument::new_invalid(key("users/3"));
        assert!(!invalid.is_valid_document());
    }

    #[test]
    fn state_flags() {
        let mut doc = MutableDocument::new_invalid(key("users/1"));
        doc.convert_to_found(SnapshotVersion::NONE, ObjectValue::empty())
            .set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.has_pending_writes());

        doc.convert_to_found(SnapshotVersion::from_micros(5), ObjectValue::empty());
        assert!(!doc.has_pending_writes());

        let unknown = MutableDocument::new_unknown(key("users/1"), SnapshotVersion::from_micros(5));
        assert!(unknown.has_committed_mutations());
    }

    #[test]
    fn key_field_resolves_to_reference() {
        let doc = MutableDocument::new_found(key("users/1"), SnapshotVersion::NONE, ObjectValue::empty());
        assert_eq!(
            doc.field_value(&FieldPath::key_path()),
            Some(Value::Reference("users/1".to_string()))
        );
    }
}
