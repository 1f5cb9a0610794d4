//! Ordered set of documents used as a query result.

use crate::document::{Document, DocumentMap};
use crate::path::DocumentKey;
use crate::sorted_map::{Comparator, SortedMap};
use crate::sorted_set::SortedSet;
use std::fmt;
use std::sync::Arc;

/// Documents ordered by a query comparator, with a key index.
///
/// Ties under the comparator are broken by key so that distinct documents
/// never collapse.
#[derive(Clone)]
pub struct DocumentSet {
    key_index: DocumentMap,
    sorted: SortedSet<Document>,
}

impl DocumentSet {
    /// Creates an empty set ordered by `comparator`, then by key.
    pub fn new(comparator: Comparator<Document>) -> Self {
        let ordered: Comparator<Document> = Arc::new(move |a: &Document, b: &Document| {
            comparator(a, b).then_with(|| a.key().cmp(b.key()))
        });
        Self {
            key_index: SortedMap::new(),
            sorted: SortedSet::with_comparator(ordered),
        }
    }

    /// Creates an empty set ordered only by key.
    pub fn by_key() -> Self {
        Self::new(Arc::new(Document::compare_by_key))
    }

    /// Returns a set with the same ordering and no documents.
    pub fn empty_like(&self) -> Self {
        Self {
            key_index: SortedMap::new(),
            sorted: SortedSet::with_comparator(Arc::clone(self.sorted.comparator())),
        }
    }

    /// True if a document with `key` is present.
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    /// Returns the document with `key`.
    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    /// The first document in query order.
    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    /// The last document in query order.
    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.key_index.len()
    }

    /// True if there are no documents.
    pub fn is_empty(&self) -> bool {
        self.key_index.is_empty()
    }

    /// Position of the document with `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.key_index.get(key)?;
        self.sorted.index_of(doc)
    }

    /// Iterates in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    /// Returns a copy with `doc` added, replacing any document with its key.
    #[must_use]
    pub fn add(&self, doc: Document) -> Self {
        let base = self.delete(doc.key());
        Self {
            key_index: base.key_index.insert(doc.key().clone(), doc.clone()),
            sorted: base.sorted.insert(doc),
        }
    }

    /// Returns a copy without the document for `key`.
    #[must_use]
    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.key_index.get(key) {
            Some(doc) => Self {
                key_index: self.key_index.remove(key),
                sorted: self.sorted.remove(doc),
            },
            None => self.clone(),
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(Document::key)).finish()
    }
}
