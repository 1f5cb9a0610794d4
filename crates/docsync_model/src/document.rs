//! Document states as seen by the local cache.

use crate::path::{DocumentKey, FieldPath};
use crate::sorted_map::SortedMap;
use crate::sorted_set::SortedSet;
use crate::value::{FieldValue, ObjectValue};
use crate::version::SnapshotVersion;
use std::cmp::Ordering;
use std::sync::Arc;

/// Whether a document carries writes the backend has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DocumentState {
    /// Matches the backend state.
    #[default]
    Synced,
    /// Has local writes that have not been acknowledged.
    LocalMutations,
    /// Has acknowledged writes that no watch snapshot has confirmed yet.
    CommittedMutations,
}

/// An existing document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: Arc<ObjectValue>,
    state: DocumentState,
}

impl Document {
    /// Creates a document.
    pub fn new(key: DocumentKey, version: SnapshotVersion, data: ObjectValue, state: DocumentState) -> Self {
        Self {
            key,
            version,
            data: Arc::new(data),
            state,
        }
    }

    /// The document key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The version the document was last updated at.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// The document data.
    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    /// Returns the value at `path`.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldValue> {
        self.data.field(path)
    }

    /// The mutation state.
    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// True when local writes are pending.
    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::LocalMutations
    }

    /// True when writes were acknowledged but not yet observed via watch.
    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::CommittedMutations
    }

    /// True when the document is not yet in sync with the backend.
    pub fn has_pending_writes(&self) -> bool {
        self.state != DocumentState::Synced
    }

    /// Orders documents by key.
    pub fn compare_by_key(a: &Document, b: &Document) -> Ordering {
        a.key.cmp(&b.key)
    }

    /// Orders documents by the value at `field`; missing values sort first.
    pub fn compare_by_field(field: &FieldPath, a: &Document, b: &Document) -> Ordering {
        match (a.field(field), b.field(field)) {
            (Some(v1), Some(v2)) => v1.compare(v2),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// A document known not to exist at a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    /// Creates a deleted-document marker.
    ///
    /// A version of [`SnapshotVersion::MIN`] means "known absent, time
    /// unknown" and is not a timestamped delete.
    pub fn new(key: DocumentKey, version: SnapshotVersion, has_committed_mutations: bool) -> Self {
        Self {
            key,
            version,
            has_committed_mutations,
        }
    }

    /// The document key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The version the deletion was observed at.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// True if an acknowledged delete produced this marker.
    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document whose state is unknown; the backend accepted a write whose
/// outcome the client cannot compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    /// Creates an unknown-document marker.
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    /// The document key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The version of the write that produced this marker.
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

/// Any of the states a cached key may be in.
#[derive(Debug, Clone, PartialEq)]
pub enum MaybeDocument {
    /// The document exists.
    Document(Document),
    /// The document is known to be absent.
    NoDocument(NoDocument),
    /// The document state is unknown.
    Unknown(UnknownDocument),
}

impl MaybeDocument {
    /// The document key.
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::Unknown(doc) => doc.key(),
        }
    }

    /// The version.
    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::Unknown(doc) => doc.version(),
        }
    }

    /// True if the state was produced by a write the watch stream has not
    /// confirmed yet.
    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    /// True if an acknowledged write produced this state.
    pub fn has_committed_mutations(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_committed_mutations(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    /// Returns the document if it exists.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Converts into the document if it exists.
    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// True for existing documents.
    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    /// True for the "known absent, time unknown" marker.
    pub fn is_no_document_at_min(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(doc) if doc.version().is_min())
    }
}

impl From<Document> for MaybeDocument {
    fn from(doc: Document) -> Self {
        MaybeDocument::Document(doc)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(doc: NoDocument) -> Self {
        MaybeDocument::NoDocument(doc)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(doc: UnknownDocument) -> Self {
        MaybeDocument::Unknown(doc)
    }
}

/// Set of document keys.
pub type DocumentKeySet = SortedSet<DocumentKey>;
/// Documents by key.
pub type DocumentMap = SortedMap<DocumentKey, Document>;
/// Possibly-absent documents by key.
pub type MaybeDocumentMap = SortedMap<DocumentKey, MaybeDocument>;
/// Acknowledged versions by key.
pub type DocumentVersionMap = SortedMap<DocumentKey, SnapshotVersion>;
