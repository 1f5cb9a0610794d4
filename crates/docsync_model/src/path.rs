//! Resource paths, field paths and document keys.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the pseudo field that addresses a document's key.
pub const DOCUMENT_KEY_NAME: &str = "__name__";

/// A slash-separated path to a collection or a document.
///
/// Paths order segment by segment, and a path sorts before every longer path
/// it is a prefix of.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Creates a path from its segments.
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The empty (root) path.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a slash-separated path, ignoring empty segments.
    pub fn from_string(path: &str) -> ModelResult<Self> {
        if path.contains("//") {
            return Err(ModelError::invalid_path(path, "path contains empty segments"));
        }
        Ok(Self::new(path.split('/').filter(|s| !s.is_empty())))
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the segment at `index`.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Returns the first segment.
    pub fn first_segment(&self) -> Option<&str> {
        self.get(0)
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

    /// Returns this path without its last segment.
    #[must_use]
    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns true if this path is a prefix of `other` (or equal to it).
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Returns true if `other` is exactly one segment below this path.
    pub fn is_immediate_parent_of(&self, other: &ResourcePath) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    /// Iterates over the segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    /// Returns the slash-joined form used in canonical ids.
    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// A dot-separated path to a field inside a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Creates a field path from its segments.
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a dot-separated field path such as `address.city`.
    pub fn from_dot_separated(path: &str) -> ModelResult<Self> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ModelError::invalid_path(path, "field paths must not contain empty segments"));
        }
        Ok(Self::new(path.split('.')))
    }

    /// The path addressing the document key.
    pub fn key_field() -> Self {
        Self::new([DOCUMENT_KEY_NAME])
    }

    /// Returns true if this path addresses the document key.
    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == DOCUMENT_KEY_NAME
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the first segment.
    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Returns the last segment.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the path without its first segment.
    #[must_use]
    pub fn pop_first(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Returns the path without its last segment.
    #[must_use]
    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns true if this path is a prefix of `other` (or equal to it).
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Iterates over the segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(String::as_str)
    }

    /// Returns the dot-joined form used in canonical ids.
    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// The identity of a document: a resource path with an even number of
/// segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    /// Creates a key from a path, rejecting collection paths.
    pub fn from_path(path: ResourcePath) -> ModelResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(ModelError::invalid_path(
                path.canonical_string(),
                "document keys need a non-empty, even number of segments",
            ));
        }
        Ok(Self { path })
    }

    /// The key with an empty path; sorts before every other key and is only
    /// meant as a range sentinel.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::empty(),
        }
    }

    /// Parses a slash-separated document path such as `rooms/eros`.
    pub fn from_string(path: &str) -> ModelResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    /// Returns true if `path` can name a document.
    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    /// Returns the full path of the document.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Returns the path of the collection containing the document.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.pop_last()
    }

    /// Returns the id of the collection containing the document.
    pub fn collection_group(&self) -> &str {
        self.path
            .len()
            .checked_sub(2)
            .and_then(|index| self.path.get(index))
            .unwrap_or_default()
    }

    /// Returns true if the document's parent collection is named `id`.
    pub fn has_collection_id(&self, id: &str) -> bool {
        self.collection_group() == id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_path_parsing_and_ordering() {
        let a = ResourcePath::from_string("rooms/a").unwrap();
        let b = ResourcePath::from_string("rooms/a/messages").unwrap();
        let c = ResourcePath::from_string("rooms/b").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(a.is_prefix_of(&b));
        assert!(a.is_immediate_parent_of(&b));
        assert!(!a.is_immediate_parent_of(&c));
        assert!(ResourcePath::from_string("a//b").is_err());
    }

    #[test]
    fn document_key_requires_even_segments() {
        assert!(DocumentKey::from_string("rooms").is_err());
        assert!(DocumentKey::from_string("").is_err());
        let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(key.collection_group(), "messages");
        assert!(key.has_collection_id("messages"));
        assert_eq!(key.collection_path().canonical_string(), "rooms/eros/messages");
    }

    #[test]
    fn field_path_key_field() {
        assert!(FieldPath::key_field().is_key_field());
        let path = FieldPath::from_dot_separated("address.city").unwrap();
        assert_eq!(path.len(), 2);
        assert!(!path.is_key_field());
        assert!(FieldPath::from_dot_separated("a..b").is_err());
        assert!(path.pop_last().is_prefix_of(&path));
    }
}
