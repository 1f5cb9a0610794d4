//! Groups of mutations written atomically.

use crate::document::{DocumentKeySet, DocumentVersionMap, MaybeDocument, MaybeDocumentMap};
use crate::mutation::{Mutation, MutationResult};
use crate::path::DocumentKey;
use crate::types::BatchId;
use crate::version::{SnapshotVersion, Timestamp};
use bytes::Bytes;

/// An atomic group of mutations queued for the backend.
///
/// `base_mutations` are applied before `mutations` in local mode only. They
/// pin the values non-idempotent transforms are computed against.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatch {
    /// Queue position; strictly increasing.
    pub batch_id: BatchId,
    /// When the write was made on this client.
    pub local_write_time: Timestamp,
    /// Local-only base value patches.
    pub base_mutations: Vec<Mutation>,
    /// The user's mutations.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Creates a batch.
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        assert!(!mutations.is_empty(), "cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged batch to the cached state of `key`.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        if let Some(doc) = &maybe_doc {
            assert_eq!(doc.key(), key, "apply_to_remote_document called with the wrong key");
        }
        let results = &batch_result.mutation_results;
        assert_eq!(
            results.len(),
            self.mutations.len(),
            "mismatched mutation results for batch {}",
            self.batch_id
        );
        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current.as_ref(), result));
            }
        }
        current
    }

    /// Computes the local view of `key` with this batch applied.
    pub fn apply_to_local_view(&self, key: &DocumentKey, maybe_doc: Option<MaybeDocument>) -> Option<MaybeDocument> {
        if let Some(doc) = &maybe_doc {
            assert_eq!(doc.key(), key, "apply_to_local_view called with the wrong key");
        }
        let base_doc = maybe_doc.clone();
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(current, base_doc.as_ref(), self.local_write_time);
            }
        }
        current
    }

    /// Applies the batch to every affected entry of `docs`.
    #[must_use]
    pub fn apply_to_local_document_set(&self, docs: &MaybeDocumentMap) -> MaybeDocumentMap {
        let mut result = docs.clone();
        for key in self.keys().iter() {
            let current = docs.get(key).cloned();
            if let Some(updated) = self.apply_to_local_view(key, current) {
                result = result.insert(key.clone(), updated);
            }
        }
        result
    }

    /// The keys this batch writes.
    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .fold(DocumentKeySet::new(), |keys, mutation| keys.insert(mutation.key().clone()))
    }
}

/// A batch together with the backend's acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatchResult {
    /// The acknowledged batch.
    pub batch: MutationBatch,
    /// Version the whole batch committed at.
    pub commit_version: SnapshotVersion,
    /// One result per mutation.
    pub mutation_results: Vec<MutationResult>,
    /// Write stream token returned with the acknowledgement.
    pub stream_token: Bytes,
    /// Acknowledged version per written key.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    /// Pairs a batch with its results and computes per-key versions.
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> Self {
        assert_eq!(
            batch.mutations.len(),
            mutation_results.len(),
            "mutations sent {} must equal results received {}",
            batch.mutations.len(),
            mutation_results.len()
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .fold(DocumentVersionMap::new(), |versions, (mutation, result)| {
                versions.insert(mutation.key().clone(), result.version)
            });
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, DocumentState};
    use crate::mutation::{FieldTransform, TransformOperation};
    use crate::path::FieldPath;
    use crate::value::{FieldValue, ObjectValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn local_view_applies_only_matching_mutations() {
        let batch = MutationBatch::new(
            BatchId(1),
            Timestamp::new(1, 0),
            vec![],
            vec![
                Mutation::set(key("c/a"), ObjectValue::from_fields([("v", 1.into())])),
                Mutation::delete(key("c/b")),
            ],
        );
        let a = batch.apply_to_local_view(&key("c/a"), None).unwrap();
        assert!(a.as_document().unwrap().has_local_mutations());
        let b = batch.apply_to_local_view(&key("c/b"), None).unwrap();
        assert!(b.is_no_document_at_min());
        assert_eq!(batch.apply_to_local_view(&key("c/z"), None), None);
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn base_mutations_run_first() {
        let n = FieldPath::from_dot_separated("n").unwrap();
        let original: MaybeDocument = Document::new(
            key("c/a"),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_fields([("n", 10.into())]),
            DocumentState::Synced,
        )
        .into();
        let increment = Mutation::transform(
            key("c/a"),
            vec![FieldTransform::new(n.clone(), TransformOperation::NumericIncrement(1.into()))],
        );
        let base_value = increment.extract_base_value(Some(&original)).unwrap();
        let batch = MutationBatch::new(
            BatchId(1),
            Timestamp::new(1, 0),
            vec![Mutation::Patch {
                key: key("c/a"),
                data: base_value,
                mask: crate::mutation::FieldMask::new([n.clone()]),
                precondition: crate::mutation::Precondition::Exists(true),
            }],
            vec![increment],
        );
        // The remote document moved on, but the batch still applies to the captured base.
        let moved: MaybeDocument = Document::new(
            key("c/a"),
            SnapshotVersion::from_micros(2),
            ObjectValue::from_fields([("n", 50.into())]),
            DocumentState::Synced,
        )
        .into();
        let local = batch.apply_to_local_view(&key("c/a"), Some(moved)).unwrap();
        assert_eq!(local.as_document().unwrap().field(&n), Some(&FieldValue::Integer(11)));
    }

    #[test]
    fn batch_result_versions() {
        let batch = MutationBatch::new(
            BatchId(3),
            Timestamp::new(1, 0),
            vec![],
            vec![Mutation::set(key("c/a"), ObjectValue::empty())],
        );
        let version = SnapshotVersion::from_micros(9);
        let result = MutationBatchResult::from(
            batch.clone(),
            version,
            vec![MutationResult::new(version, None)],
            Bytes::from_static(b"token"),
        );
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&version));
        let remote = batch.apply_to_remote_document(&key("c/a"), None, &result).unwrap();
        assert!(remote.has_committed_mutations());
        assert_eq!(remote.version(), version);
    }
}
