//! Property-based test generators using proptest.
//!
//! Strategies for model values that respect the model's invariants: keys
//! always have an even number of segments and versions are never negative.

use docsync_model::{
    Document, DocumentKey, DocumentState, FieldValue, Mutation, ObjectValue, ResourcePath, SnapshotVersion,
};
use proptest::prelude::*;

/// Strategy for collection and document ids.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for document keys one or two levels deep.
pub fn document_key_strategy() -> impl Strategy<Value = DocumentKey> {
    prop::collection::vec(segment_strategy(), 1..=2).prop_flat_map(|collections| {
        prop::collection::vec(segment_strategy(), collections.len()).prop_map(move |ids| {
            let segments = collections
                .iter()
                .zip(ids.iter())
                .flat_map(|(collection, id)| [collection.clone(), id.clone()]);
            DocumentKey::from_path(ResourcePath::new(segments)).expect("even segment count")
        })
    })
}

/// Strategy for document keys in a single collection.
pub fn key_in_collection_strategy(collection: &'static str) -> impl Strategy<Value = DocumentKey> {
    segment_strategy()
        .prop_map(move |id| DocumentKey::from_path(ResourcePath::new([collection.to_string(), id])).expect("valid key"))
}

/// Strategy for positive snapshot versions.
pub fn version_strategy() -> impl Strategy<Value = SnapshotVersion> {
    (1_i64..1_000_000).prop_map(SnapshotVersion::from_micros)
}

/// Strategy for scalar field values. Doubles are finite so equality holds.
pub fn scalar_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Boolean),
        any::<i64>().prop_map(FieldValue::Integer),
        (-1.0e9_f64..1.0e9).prop_map(FieldValue::Double),
        "[a-z ]{0,12}".prop_map(FieldValue::String),
    ]
}

/// Strategy for field values nested at most two levels deep.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    scalar_value_strategy().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(FieldValue::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|fields| FieldValue::Map(ObjectValue::from_fields(fields))),
        ]
    })
}

/// Strategy for document contents.
pub fn object_strategy() -> impl Strategy<Value = ObjectValue> {
    prop::collection::btree_map("[a-z]{1,6}", field_value_strategy(), 0..6)
        .prop_map(|fields| ObjectValue::from_fields(fields))
}

/// Strategy for synced documents in `collection`.
pub fn document_strategy(collection: &'static str) -> impl Strategy<Value = Document> {
    (key_in_collection_strategy(collection), version_strategy(), object_strategy())
        .prop_map(|(key, version, data)| Document::new(key, version, data, DocumentState::Synced))
}

/// Strategy for set and delete mutations of documents in `collection`.
pub fn mutation_strategy(collection: &'static str) -> impl Strategy<Value = Mutation> {
    prop_oneof![
        3 => (key_in_collection_strategy(collection), object_strategy())
            .prop_map(|(key, value)| Mutation::set(key, value)),
        1 => key_in_collection_strategy(collection).prop_map(Mutation::delete),
    ]
}
