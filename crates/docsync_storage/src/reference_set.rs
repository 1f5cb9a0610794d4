//! Reference tracking between document keys and ids.

use docsync_model::{Comparator, DocumentKey, DocumentKeySet, SortedSet};
use std::sync::Arc;

/// A `(key, id)` reference; the id is a target id or batch id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocReference {
    /// The referenced document.
    pub key: DocumentKey,
    /// The referencing target or batch.
    pub id: i32,
}

impl DocReference {
    /// Creates a reference.
    pub fn new(key: DocumentKey, id: i32) -> Self {
        Self { key, id }
    }

    /// The smallest reference for `key`.
    pub(crate) fn first_for_key(key: DocumentKey) -> Self {
        Self::new(key, i32::MIN)
    }

    fn compare_by_id(a: &DocReference, b: &DocReference) -> std::cmp::Ordering {
        a.id.cmp(&b.id).then_with(|| a.key.cmp(&b.key))
    }
}

/// A collection of references indexed by key and by id.
///
/// Used for local view pins, limbo document references and the in-memory
/// target-to-document mapping.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    by_key: SortedSet<DocReference>,
    by_id: SortedSet<DocReference>,
}

impl Default for ReferenceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        let by_id: Comparator<DocReference> = Arc::new(DocReference::compare_by_id);
        Self {
            by_key: SortedSet::new(),
            by_id: SortedSet::with_comparator(by_id),
        }
    }

    /// True if there are no references.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Adds a reference.
    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        let reference = DocReference::new(key, id);
        self.by_key = self.by_key.insert(reference.clone());
        self.by_id = self.by_id.insert(reference);
    }

    /// Adds a reference from `id` to every key.
    pub fn add_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.add_reference(key.clone(), id);
        }
    }

    /// Removes a reference.
    pub fn remove_reference(&mut self, key: DocumentKey, id: i32) {
        let reference = DocReference::new(key, id);
        self.by_key = self.by_key.remove(&reference);
        self.by_id = self.by_id.remove(&reference);
    }

    /// Removes the references from `id` to every key.
    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.remove_reference(key.clone(), id);
        }
    }

    /// Removes every reference held by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let released: Vec<DocumentKey> = self.references_for_id(id).iter().cloned().collect();
        for key in &released {
            self.remove_reference(key.clone(), id);
        }
        released
    }

    /// Removes every reference.
    pub fn remove_all_references(&mut self) {
        *self = Self::new();
    }

    /// The keys referenced by `id`.
    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        let start = DocReference::new(DocumentKey::empty(), id);
        self.by_id
            .iter_from(&start)
            .take_while(|reference| reference.id == id)
            .fold(DocumentKeySet::new(), |keys, reference| keys.insert(reference.key.clone()))
    }

    /// True if any id references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter_from(&DocReference::first_for_key(key.clone()))
            .next()
            .is_some_and(|reference| &reference.key == key)
    }
}
