//! Resource paths, document keys and field paths.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the pseudo-field that refers to a document's key.
pub const DOCUMENT_KEY_NAME: &str = "__name__";

/// A slash-separated path to a collection or a document.
///
/// Paths order segment by segment, so every document of a collection sorts
/// directly after the collection path itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The empty (root) path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path from segments.
    pub fn from_segments<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a slash-separated path. Leading and trailing slashes are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the path contains an empty segment (`a//b`).
    pub fn parse(path: &str) -> CoreResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(CoreError::invalid_path(path, "empty segment"));
        }
        Ok(Self { segments })
    }

    /// Returns the path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the last segment.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the path without its last segment.
    #[must_use]
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Returns true if `other` is a direct child of `self`.
    pub fn is_immediate_parent_of(&self, other: &ResourcePath) -> bool {
        other.segments.len() == self.segments.len() + 1 && self.is_prefix_of(other)
    }

    /// Returns true if the path points at a document.
    pub fn is_document_path(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    /// Returns the slash-separated representation.
    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// The key of a document: a resource path with an even number of segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    /// Creates a key from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not point at a document.
    pub fn from_path(path: ResourcePath) -> CoreResult<Self> {
        if !path.is_document_path() {
            return Err(CoreError::invalid_path(
                path.canonical_string(),
                "document paths need an even number of segments",
            ));
        }
        Ok(Self { path })
    }

    /// Parses a key from a slash-separated string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a document path.
    pub fn parse(path: &str) -> CoreResult<Self> {
        Self::from_path(ResourcePath::parse(path)?)
    }

    /// A key that sorts before every real key.
    pub(crate) fn min() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    /// The smallest key below `collection`, used as a scan start.
    pub(crate) fn scan_start(collection: &ResourcePath) -> Self {
        Self {
            path: collection.child(""),
        }
    }

    /// Returns the underlying path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Returns the path of the collection holding this document.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent()
    }

    /// Returns the collection id (last collection segment).
    pub fn collection_group(&self) -> &str {
        let segments = self.path.segments();
        segments
            .len()
            .checked_sub(2)
            .and_then(|i| segments.get(i))
            .map_or("", String::as_str)
    }

    /// Returns the document id.
    pub fn document_id(&self) -> &str {
        self.path.last_segment().unwrap_or("")
    }

    /// Returns true if the document lives directly in `collection`.
    pub fn has_collection(&self, collection: &ResourcePath) -> bool {
        collection.is_immediate_parent_of(&self.path)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.fmt(f)
    }
}

/// A dot-separated path to a field inside a document.
///
/// Segments that are not plain identifiers are written between backticks,
/// e.g. `` a.`b.c`.d `` has the three segments `a`, `b.c` and `d`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Builds a field path from segments.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no segments or one of them is empty.
    pub fn from_segments<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> CoreResult<Self> {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(CoreError::invalid_path(
                segments.join("."),
                "field paths need non-empty segments",
            ));
        }
        Ok(Self { segments })
    }

    /// Builds a single-segment path without validation.
    pub(crate) fn from_single_segment(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    /// Returns the special path referring to the document key.
    pub fn key_path() -> Self {
        Self {
            segments: vec![DOCUMENT_KEY_NAME.to_string()],
        }
    }

    /// Parses a dot-separated path, honoring backtick quoting.
    ///
    /// # Errors
    ///
    /// Returns an error for empty segments or an unterminated quote.
    pub fn parse(path: &str) -> CoreResult<Self> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut chars = path.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' if quoted => match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(CoreError::invalid_path(path, "trailing escape")),
                },
                '`' => quoted = !quoted,
                '.' if !quoted => {
                    if current.is_empty() {
                        return Err(CoreError::invalid_path(path, "empty segment"));
                    }
                    segments.push(std::mem::take(&mut current));
                }
                c => current.push(c),
            }
        }
        if quoted {
            return Err(CoreError::invalid_path(path, "unterminated backtick"));
        }
        if current.is_empty() {
            return Err(CoreError::invalid_path(path, "empty segment"));
        }
        segments.push(current);
        Ok(Self { segments })
    }

    /// Returns the segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns the first segment.
    pub fn first_segment(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }

    /// Returns true if this path refers to the document key.
    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the parent path, or `None` for single-segment paths.
    pub fn parent(&self) -> Option<Self> {
        (self.segments.len() > 1).then(|| Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns true if `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Returns the dot-separated representation with quoting.
    pub fn canonical_string(&self) -> String {
        self.segments
            .iter()
            .map(|s| {
                if is_identifier(s) {
                    s.clone()
                } else {
                    format!("`{}`", s.replace('\\', "\\\\").replace('`', "\\`"))
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}
