//! Test fixtures for model values.
//!
//! Short constructors for keys, documents, queries and mutations so tests
//! read like the scenarios they describe.

use bytes::Bytes;
use docsync_model::{
    Direction, Document, DocumentKey, DocumentState, FieldFilter, FieldMask, FieldPath, FieldValue, MaybeDocument,
    Mutation, NoDocument, ObjectValue, Operator, OrderBy, Query, ResourcePath, SnapshotVersion, UnknownDocument,
};
use docsync_protocol::WireDocument;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Field list for documents without fields.
pub const NO_FIELDS: [(&str, FieldValue); 0] = [];

/// Installs a test-friendly `tracing` subscriber once per process.
///
/// Output is filtered by `RUST_LOG` and captured by the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A resource path from a slash-separated string.
pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).expect("invalid path")
}

/// A document key from a slash-separated string.
pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("invalid document key")
}

/// A snapshot version from a small integer.
pub fn version(version: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(version)
}

/// A resume or stream token.
pub fn token(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

/// An object from `(field, value)` pairs.
pub fn object<V: Into<FieldValue>>(fields: impl IntoIterator<Item = (&'static str, V)>) -> ObjectValue {
    ObjectValue::from_fields(fields.into_iter().map(|(name, value)| (name, value.into())))
}

/// A synced document.
pub fn doc<V: Into<FieldValue>>(
    key_path: &str,
    version_value: i64,
    fields: impl IntoIterator<Item = (&'static str, V)>,
) -> Document {
    Document::new(key(key_path), version(version_value), object(fields), DocumentState::Synced)
}

/// A document carrying a local, unacknowledged write.
pub fn local_doc<V: Into<FieldValue>>(
    key_path: &str,
    version_value: i64,
    fields: impl IntoIterator<Item = (&'static str, V)>,
) -> Document {
    Document::new(key(key_path), version(version_value), object(fields), DocumentState::LocalMutations)
}

/// A synced document wrapped as a [`MaybeDocument`].
pub fn maybe_doc<V: Into<FieldValue>>(
    key_path: &str,
    version_value: i64,
    fields: impl IntoIterator<Item = (&'static str, V)>,
) -> MaybeDocument {
    MaybeDocument::Document(doc(key_path, version_value, fields))
}

/// A known-deleted document.
pub fn deleted_doc(key_path: &str, version_value: i64) -> MaybeDocument {
    MaybeDocument::NoDocument(NoDocument::new(key(key_path), version(version_value), false))
}

/// A document whose contents are unknown.
pub fn unknown_doc(key_path: &str, version_value: i64) -> MaybeDocument {
    MaybeDocument::Unknown(UnknownDocument::new(key(key_path), version(version_value)))
}

/// A document as the backend sends it.
pub fn wire_doc<V: Into<FieldValue>>(
    key_path: &str,
    version_value: i64,
    fields: impl IntoIterator<Item = (&'static str, V)>,
) -> WireDocument {
    WireDocument::new(key(key_path), object(fields), version(version_value))
}

/// A collection query.
pub fn query(path_value: &str) -> Query {
    Query::at_path(path(path_value))
}

/// A field filter.
///
/// # Panics
///
/// Panics on filters the model rejects, such as `null` inequalities.
pub fn filter(field: &str, op: Operator, value: impl Into<FieldValue>) -> FieldFilter {
    let field = FieldPath::from_dot_separated(field).expect("invalid field path");
    FieldFilter::create(field, op, value.into()).expect("invalid filter")
}

/// An order-by clause.
pub fn order_by(field: &str, direction: Direction) -> OrderBy {
    OrderBy::new(FieldPath::from_dot_separated(field).expect("invalid field path"), direction)
}

/// A set mutation.
pub fn set_mutation<V: Into<FieldValue>>(key_path: &str, fields: impl IntoIterator<Item = (&'static str, V)>) -> Mutation {
    Mutation::set(key(key_path), object(fields))
}

/// A patch mutation masking exactly the given fields.
pub fn patch_mutation<V: Into<FieldValue>>(
    key_path: &str,
    fields: impl IntoIterator<Item = (&'static str, V)>,
) -> Mutation {
    let data = object(fields);
    let mask = FieldMask::from_object(&data);
    Mutation::patch(key(key_path), data, mask)
}

/// A delete mutation.
pub fn delete_mutation(key_path: &str) -> Mutation {
    Mutation::delete(key(key_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docs_carry_their_fields() {
        let d = doc("rooms/eros", 3, [("n", 1_i64)]);
        assert_eq!(d.key(), &key("rooms/eros"));
        assert_eq!(d.version(), version(3));
        assert_eq!(d.data().len(), 1);
        assert!(!d.has_pending_writes());
    }

    #[test]
    fn local_docs_have_pending_writes() {
        assert!(local_doc("rooms/eros", 0, [("n", 1_i64)]).has_pending_writes());
    }

    #[test]
    fn filtered_queries_match_documents() {
        let q = query("rooms").with_filter(filter("n", Operator::GreaterThan, 1_i64));
        assert!(q.matches(&doc("rooms/a", 1, [("n", 2_i64)])));
        assert!(!q.matches(&doc("rooms/b", 1, [("n", 0_i64)])));
    }
}
