//! Write operations and how they transform documents.
//!
//! Each [`Mutation`] applies in two modes. Local application is optimistic
//! and keeps the prior version for Set, Patch and Transform (Delete resets
//! it to [`SnapshotVersion::MIN`]). Remote application runs after the
//! backend acknowledged the write and adopts the version and transform
//! results from the [`MutationResult`].

use crate::document::{Document, DocumentState, MaybeDocument, NoDocument, UnknownDocument};
use crate::path::{DocumentKey, FieldPath};
use crate::value::{FieldValue, ObjectValue};
use crate::version::{SnapshotVersion, Timestamp};
use serde::{Deserialize, Serialize};

/// A required prior state for a mutation to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precondition {
    /// Always holds.
    #[default]
    None,
    /// Holds when the existence of a document matches the flag.
    Exists(bool),
    /// Holds when the document exists at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    /// True for [`Precondition::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    /// Checks the precondition against the current state, if any.
    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == maybe_doc.is_some_and(MaybeDocument::is_document),
            Precondition::UpdateTime(version) => {
                matches!(maybe_doc, Some(MaybeDocument::Document(doc)) if doc.version() == *version)
            }
        }
    }
}

/// The set of field paths a patch touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    /// Creates a mask; duplicate paths are collapsed.
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        let mut fields: Vec<_> = fields.into_iter().collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    /// The masked paths.
    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    /// True if `path` is equal to or nested under a masked path.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    /// A mask of every leaf field in `value`. Empty nested maps count as
    /// leaves.
    pub fn from_object(value: &ObjectValue) -> Self {
        fn collect(value: &ObjectValue, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
            for (name, field) in value.iter() {
                prefix.push(name.clone());
                match field.as_map() {
                    Some(nested) if !nested.is_empty() => collect(nested, prefix, out),
                    _ => out.push(FieldPath::new(prefix.iter().cloned())),
                }
                prefix.pop();
            }
        }
        let mut fields = Vec::new();
        collect(value, &mut Vec::new(), &mut fields);
        Self::new(fields)
    }
}

/// A field transform whose value is resolved by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    /// Replaces the field with the commit time.
    ServerTimestamp,
    /// Appends the elements not already present.
    ArrayUnion(Vec<FieldValue>),
    /// Removes every element equal to one of these.
    ArrayRemove(Vec<FieldValue>),
    /// Adds the operand to the current numeric value.
    NumericIncrement(FieldValue),
}

impl TransformOperation {
    /// Computes the optimistic local value.
    pub fn apply_to_local_view(&self, previous: Option<&FieldValue>, local_write_time: Timestamp) -> FieldValue {
        match self {
            TransformOperation::ServerTimestamp => FieldValue::ServerTimestamp {
                local_write_time,
                previous_value: previous.cloned().map(Box::new),
            },
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                FieldValue::Array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerce_array(previous);
                values.retain(|value| !elements.contains(value));
                FieldValue::Array(values)
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self.compute_base_value(previous).unwrap_or(FieldValue::Integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Computes the acknowledged value from the backend's transform result.
    pub fn apply_to_remote_document(&self, previous: Option<&FieldValue>, result: Option<&FieldValue>) -> FieldValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                // The result for array transforms is not meaningful; recompute.
                self.apply_to_local_view(previous, Timestamp::default())
            }
            TransformOperation::ServerTimestamp => result.cloned().unwrap_or(FieldValue::Null),
            TransformOperation::NumericIncrement(_) => match result {
                Some(value) => value.clone(),
                None => self.apply_to_local_view(previous, Timestamp::default()),
            },
        }
    }

    /// Returns the base value a non-idempotent transform needs captured.
    ///
    /// Only numeric increments have one: the previous value if it is a
    /// number, else integer 0.
    pub fn compute_base_value(&self, previous: Option<&FieldValue>) -> Option<FieldValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FieldValue::Integer(0)),
            },
            _ => None,
        }
    }

    /// True if applying twice gives the same result as applying once.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

fn coerce_array(previous: Option<&FieldValue>) -> Vec<FieldValue> {
    previous
        .and_then(FieldValue::as_array)
        .map(<[FieldValue]>::to_vec)
        .unwrap_or_default()
}

fn as_f64(value: &FieldValue) -> f64 {
    match value {
        FieldValue::Integer(i) => *i as f64,
        FieldValue::Double(d) => *d,
        _ => 0.0,
    }
}

fn add_numbers(base: &FieldValue, operand: &FieldValue) -> FieldValue {
    match (base, operand) {
        (FieldValue::Integer(a), FieldValue::Integer(b)) => FieldValue::Integer(a.saturating_add(*b)),
        _ => FieldValue::Double(as_f64(base) + as_f64(operand)),
    }
}

/// A transform applied to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    /// The transformed field.
    pub field: FieldPath,
    /// The operation.
    pub operation: TransformOperation,
}

impl FieldTransform {
    /// Creates a field transform.
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// The backend's result for one acknowledged mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    /// Version of the document after the write; the commit version when the
    /// backend sent no update time.
    pub version: SnapshotVersion,
    /// Server-computed values, one per field transform.
    pub transform_results: Option<Vec<FieldValue>>,
}

impl MutationResult {
    /// Creates a result.
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FieldValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// A self-contained change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        /// Target document.
        key: DocumentKey,
        /// New contents.
        value: ObjectValue,
        /// Required prior state.
        precondition: Precondition,
    },
    /// Updates the masked fields; masked paths missing from `data` are deleted.
    Patch {
        /// Target document.
        key: DocumentKey,
        /// Values for the masked paths.
        data: ObjectValue,
        /// Touched paths.
        mask: FieldMask,
        /// Required prior state.
        precondition: Precondition,
    },
    /// Applies field transforms to an existing document.
    Transform {
        /// Target document.
        key: DocumentKey,
        /// The transforms, in order.
        field_transforms: Vec<FieldTransform>,
    },
    /// Deletes the document.
    Delete {
        /// Target document.
        key: DocumentKey,
        /// Required prior state.
        precondition: Precondition,
    },
    /// Asserts a precondition without changing the document.
    Verify {
        /// Target document.
        key: DocumentKey,
        /// The asserted state.
        precondition: Precondition,
    },
}

impl Mutation {
    /// A set without precondition.
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    /// A patch that requires the document to exist.
    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            mask,
            precondition: Precondition::Exists(true),
        }
    }

    /// A transform.
    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform { key, field_transforms }
    }

    /// A delete without precondition.
    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    /// A verify.
    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    /// The mutated document.
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    /// The precondition; transforms always require an existing document.
    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    fn verify_key_matches(&self, maybe_doc: Option<&MaybeDocument>) {
        if let Some(doc) = maybe_doc {
            assert_eq!(doc.key(), self.key(), "can only apply a mutation to a document with the same key");
        }
    }

    /// Applies the mutation after the backend acknowledged it.
    ///
    /// The backend accepted the write, so its precondition held there. When
    /// the local state disagrees, the result is an [`UnknownDocument`] that
    /// waits for the watch stream to deliver the real contents.
    pub fn apply_to_remote_document(&self, maybe_doc: Option<&MaybeDocument>, result: &MutationResult) -> MaybeDocument {
        self.verify_key_matches(maybe_doc);
        let key = self.key().clone();
        match self {
            Mutation::Set { value, .. } => {
                assert!(result.transform_results.is_none(), "transform results received by a set");
                Document::new(key, result.version, value.clone(), DocumentState::CommittedMutations).into()
            }
            Mutation::Patch { .. } => {
                assert!(result.transform_results.is_none(), "transform results received by a patch");
                if !self.precondition().is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key, result.version).into();
                }
                let data = self.patch_document(maybe_doc);
                Document::new(key, result.version, data, DocumentState::CommittedMutations).into()
            }
            Mutation::Transform { field_transforms, .. } => {
                let Some(doc) = maybe_doc.and_then(MaybeDocument::as_document) else {
                    return UnknownDocument::new(key, result.version).into();
                };
                let server_results = result.transform_results.as_deref().unwrap_or_default();
                assert_eq!(
                    server_results.len(),
                    field_transforms.len(),
                    "server transform result count must match the field transform count"
                );
                let results = field_transforms
                    .iter()
                    .zip(server_results)
                    .map(|(transform, server)| {
                        transform
                            .operation
                            .apply_to_remote_document(doc.field(&transform.field), Some(server))
                    })
                    .collect::<Vec<_>>();
                let data = transform_object(doc.data(), field_transforms, results);
                Document::new(key, result.version, data, DocumentState::CommittedMutations).into()
            }
            Mutation::Delete { .. } => {
                assert!(result.transform_results.is_none(), "transform results received by a delete");
                NoDocument::new(key, result.version, true).into()
            }
            // A verify only guards the batch; an existing state keeps its
            // version and flags.
            Mutation::Verify { .. } => match maybe_doc {
                Some(doc) => doc.clone(),
                None => UnknownDocument::new(key, result.version).into(),
            },
        }
    }

    /// Applies the mutation optimistically.
    ///
    /// `base_doc` is the state before the whole batch was applied; it feeds
    /// transforms whose field was cleared by an earlier patch in the batch.
    /// Returns the input unchanged when the precondition fails.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        self.verify_key_matches(maybe_doc.as_ref());
        if !self.precondition().is_valid_for(maybe_doc.as_ref()) {
            return maybe_doc;
        }
        let key = self.key().clone();
        let version = post_mutation_version(maybe_doc.as_ref());
        match self {
            Mutation::Set { value, .. } => {
                Some(Document::new(key, version, value.clone(), DocumentState::LocalMutations).into())
            }
            Mutation::Patch { .. } => {
                let data = self.patch_document(maybe_doc.as_ref());
                Some(Document::new(key, version, data, DocumentState::LocalMutations).into())
            }
            Mutation::Transform { field_transforms, .. } => {
                let doc = maybe_doc.as_ref().and_then(MaybeDocument::as_document)?;
                let base = base_doc.and_then(MaybeDocument::as_document);
                let results = field_transforms
                    .iter()
                    .map(|transform| {
                        let previous = doc
                            .field(&transform.field)
                            .or_else(|| base.and_then(|b| b.field(&transform.field)));
                        transform.operation.apply_to_local_view(previous, local_write_time)
                    })
                    .collect::<Vec<_>>();
                let data = transform_object(doc.data(), field_transforms, results);
                Some(Document::new(key, doc.version(), data, DocumentState::LocalMutations).into())
            }
            Mutation::Delete { .. } => Some(NoDocument::new(key, SnapshotVersion::MIN, false).into()),
            Mutation::Verify { .. } => maybe_doc,
        }
    }

    /// Captures the values non-idempotent transforms are computed against.
    ///
    /// Returns `None` when nothing needs capturing.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let Mutation::Transform { field_transforms, .. } = self else {
            return None;
        };
        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base: Option<ObjectValue> = None;
        for transform in field_transforms {
            let existing = doc.and_then(|d| d.field(&transform.field));
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base = Some(base.unwrap_or_default().set(&transform.field, value));
            }
        }
        base
    }

    fn patch_document(&self, maybe_doc: Option<&MaybeDocument>) -> ObjectValue {
        let Mutation::Patch { data, mask, .. } = self else {
            unreachable!("patch_document called on a non-patch mutation");
        };
        let mut patched = maybe_doc
            .and_then(MaybeDocument::as_document)
            .map(|doc| doc.data().clone())
            .unwrap_or_default();
        for path in mask.fields().iter().filter(|path| !path.is_empty()) {
            patched = match data.field(path) {
                Some(value) => patched.set(path, value.clone()),
                None => patched.delete(path),
            };
        }
        patched
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::MIN,
    }
}

fn transform_object(data: &ObjectValue, transforms: &[FieldTransform], results: Vec<FieldValue>) -> ObjectValue {
    transforms
        .iter()
        .zip(results)
        .fold(data.clone(), |object, (transform, value)| object.set(&transform.field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn mask_from_object_lists_leaves() {
        let nested = ObjectValue::from_fields([("b", FieldValue::from(1)), ("c", FieldValue::from(2))]);
        let value = ObjectValue::from_fields([("a", FieldValue::Map(nested)), ("d", FieldValue::from(true))]);
        let mask = FieldMask::from_object(&value);
        assert_eq!(mask.fields(), &[field("a.b"), field("a.c"), field("d")]);
    }

    fn doc(path: &str, micros: i64, fields: ObjectValue) -> MaybeDocument {
        Document::new(key(path), SnapshotVersion::from_micros(micros), fields, DocumentState::Synced).into()
    }

    fn deleted(path: &str, micros: i64) -> MaybeDocument {
        NoDocument::new(key(path), SnapshotVersion::from_micros(micros), false).into()
    }

    fn now() -> Timestamp {
        Timestamp::new(100, 0)
    }

    #[test]
    fn set_local_transition_table() {
        let data = ObjectValue::from_fields([("a", FieldValue::Integer(1))]);
        let set = Mutation::set(key("c/d"), data.clone());

        let on_doc = set.apply_to_local_view(Some(doc("c/d", 3, ObjectValue::empty())), None, now()).unwrap();
        assert_eq!(on_doc.version(), SnapshotVersion::from_micros(3));
        assert!(on_doc.as_document().unwrap().has_local_mutations());

        let on_deleted = set.apply_to_local_view(Some(deleted("c/d", 3)), None, now()).unwrap();
        assert_eq!(on_deleted.version(), SnapshotVersion::MIN);

        let on_none = set.apply_to_local_view(None, None, now()).unwrap();
        assert_eq!(on_none.as_document().unwrap().data(), &data);
        assert_eq!(on_none.version(), SnapshotVersion::MIN);
    }

    #[test]
    fn patch_local_transition_table() {
        let patch = Mutation::patch(
            key("c/d"),
            ObjectValue::from_fields([("a", FieldValue::Integer(2))]),
            FieldMask::new([field("a"), field("gone")]),
        );
        let base = ObjectValue::from_fields([("a", FieldValue::Integer(1)), ("gone", FieldValue::Boolean(true))]);

        let patched = patch.apply_to_local_view(Some(doc("c/d", 3, base)), None, now()).unwrap();
        let patched = patched.as_document().unwrap();
        assert_eq!(patched.version(), SnapshotVersion::from_micros(3));
        assert_eq!(patched.field(&field("a")), Some(&FieldValue::Integer(2)));
        assert_eq!(patched.field(&field("gone")), None);

        assert_eq!(patch.apply_to_local_view(None, None, now()), None);
        assert_eq!(patch.apply_to_local_view(Some(deleted("c/d", 3)), None, now()), Some(deleted("c/d", 3)));
    }

    #[test]
    fn delete_local_resets_version() {
        let delete = Mutation::delete(key("c/d"));
        for prior in [Some(doc("c/d", 3, ObjectValue::empty())), Some(deleted("c/d", 3)), None] {
            let result = delete.apply_to_local_view(prior, None, now()).unwrap();
            assert!(result.is_no_document_at_min());
            assert!(!result.has_committed_mutations());
        }
    }

    #[test]
    fn transform_requires_existing_document() {
        let transform = Mutation::transform(
            key("c/d"),
            vec![FieldTransform::new(field("t"), TransformOperation::ServerTimestamp)],
        );
        assert_eq!(transform.apply_to_local_view(None, None, now()), None);
        assert_eq!(transform.apply_to_local_view(Some(deleted("c/d", 3)), None, now()), Some(deleted("c/d", 3)));

        let applied = transform
            .apply_to_local_view(Some(doc("c/d", 3, ObjectValue::empty())), None, now())
            .unwrap();
        assert!(matches!(
            applied.as_document().unwrap().field(&field("t")),
            Some(FieldValue::ServerTimestamp { local_write_time, previous_value: None }) if *local_write_time == now()
        ));
    }

    #[test]
    fn increment_converges_with_captured_base() {
        let increment = Mutation::transform(
            key("c/d"),
            vec![FieldTransform::new(field("n"), TransformOperation::NumericIncrement(FieldValue::Integer(1)))],
        );
        let original = doc("c/d", 1, ObjectValue::from_fields([("n", FieldValue::String("x".into()))]));
        let base = increment.extract_base_value(Some(&original)).unwrap();
        assert_eq!(base.field(&field("n")), Some(&FieldValue::Integer(0)));

        let base_patch = Mutation::Patch {
            key: key("c/d"),
            data: base,
            mask: FieldMask::new([field("n")]),
            precondition: Precondition::Exists(true),
        };
        // Replaying base patch then increment always yields base + 1.
        for _ in 0..3 {
            let step = base_patch.apply_to_local_view(Some(original.clone()), Some(&original), now());
            let step = increment.apply_to_local_view(step, Some(&original), now()).unwrap();
            assert_eq!(step.as_document().unwrap().field(&field("n")), Some(&FieldValue::Integer(1)));
        }
    }

    #[test]
    fn increment_arithmetic() {
        let op = TransformOperation::NumericIncrement(FieldValue::Integer(5));
        assert_eq!(op.apply_to_local_view(Some(&FieldValue::Integer(i64::MAX)), now()), FieldValue::Integer(i64::MAX));
        assert_eq!(op.apply_to_local_view(Some(&FieldValue::Double(0.5)), now()), FieldValue::Double(5.5));
        assert_eq!(op.apply_to_local_view(None, now()), FieldValue::Integer(5));
    }

    #[test]
    fn array_transforms() {
        let existing = FieldValue::Array(vec![FieldValue::Integer(1), FieldValue::Integer(2)]);
        let union = TransformOperation::ArrayUnion(vec![FieldValue::Integer(2), FieldValue::Integer(3)]);
        assert_eq!(
            union.apply_to_local_view(Some(&existing), now()),
            FieldValue::Array(vec![FieldValue::Integer(1), FieldValue::Integer(2), FieldValue::Integer(3)])
        );
        let remove = TransformOperation::ArrayRemove(vec![FieldValue::Integer(1)]);
        assert_eq!(remove.apply_to_local_view(Some(&existing), now()), FieldValue::Array(vec![FieldValue::Integer(2)]));
        assert_eq!(remove.apply_to_local_view(Some(&FieldValue::Null), now()), FieldValue::Array(vec![]));
    }

    #[test]
    fn remote_application_uses_result_version() {
        let version = SnapshotVersion::from_micros(7);
        let result = MutationResult::new(version, None);

        let set = Mutation::set(key("c/d"), ObjectValue::empty()).apply_to_remote_document(None, &result);
        assert!(set.has_committed_mutations());
        assert_eq!(set.version(), version);

        let delete = Mutation::delete(key("c/d")).apply_to_remote_document(None, &result);
        assert_eq!(delete, NoDocument::new(key("c/d"), version, true).into());

        let patch = Mutation::patch(key("c/d"), ObjectValue::empty(), FieldMask::default())
            .apply_to_remote_document(None, &result);
        assert_eq!(patch, UnknownDocument::new(key("c/d"), version).into());

        let verify = Mutation::verify(key("c/d"), Precondition::Exists(true)).apply_to_remote_document(None, &result);
        assert_eq!(verify, UnknownDocument::new(key("c/d"), version).into());
    }

    #[test]
    fn remote_verify_leaves_existing_documents_untouched() {
        let existing = doc("c/d", 3, ObjectValue::from_fields([("n", FieldValue::Integer(1))]));
        let result = MutationResult::new(SnapshotVersion::from_micros(7), None);
        let verify = Mutation::verify(key("c/d"), Precondition::Exists(true));
        let after = verify.apply_to_remote_document(Some(&existing), &result);
        assert_eq!(after, existing);
        assert!(!after.has_committed_mutations());
        assert_eq!(after.version(), SnapshotVersion::from_micros(3));
    }

    #[test]
    fn remote_transform_adopts_server_values() {
        let transform = Mutation::transform(
            key("c/d"),
            vec![FieldTransform::new(field("t"), TransformOperation::ServerTimestamp)],
        );
        let server_time = FieldValue::Timestamp(Timestamp::new(9, 0));
        let result = MutationResult::new(SnapshotVersion::from_micros(9), Some(vec![server_time.clone()]));
        let applied = transform.apply_to_remote_document(Some(&doc("c/d", 1, ObjectValue::empty())), &result);
        let applied = applied.as_document().unwrap();
        assert!(applied.has_committed_mutations());
        assert_eq!(applied.field(&field("t")), Some(&server_time));
    }

    #[test]
    fn preconditions() {
        let existing = doc("c/d", 4, ObjectValue::empty());
        assert!(Precondition::Exists(true).is_valid_for(Some(&existing)));
        assert!(Precondition::Exists(false).is_valid_for(Some(&deleted("c/d", 1))));
        assert!(Precondition::Exists(false).is_valid_for(None));
        assert!(Precondition::UpdateTime(SnapshotVersion::from_micros(4)).is_valid_for(Some(&existing)));
        assert!(!Precondition::UpdateTime(SnapshotVersion::from_micros(5)).is_valid_for(Some(&existing)));
    }
}
