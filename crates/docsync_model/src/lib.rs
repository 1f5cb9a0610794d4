//! # docsync Model
//!
//! Document data model for the docsync client.
//!
//! This crate provides:
//! - Persistent sorted maps and sets with structural sharing
//! - Paths, document keys, field values and snapshot versions
//! - Document states (`Document`, `NoDocument`, `UnknownDocument`)
//! - Mutations, mutation batches and their local/remote application
//! - Queries, targets, target metadata and target id allocation
//!
//! ## Key Invariants
//!
//! - All values are immutable; updates return new values
//! - A `NoDocument` at `SnapshotVersion::MIN` means "known absent, time
//!   unknown" and is never a timestamped delete
//! - Mutation batches apply in batch id order
//! - Every query ordering ends with the document key

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod document_set;
mod error;
mod mutation;
mod mutation_batch;
mod path;
mod query;
mod sorted_map;
mod sorted_set;
mod target_data;
mod target_id_generator;
mod types;
mod value;
mod version;

pub use document::{
    Document, DocumentKeySet, DocumentMap, DocumentState, DocumentVersionMap, MaybeDocument, MaybeDocumentMap,
    NoDocument, UnknownDocument,
};
pub use document_set::DocumentSet;
pub use error::{ModelError, ModelResult};
pub use mutation::{FieldMask, FieldTransform, Mutation, MutationResult, Precondition, TransformOperation};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use path::{DocumentKey, FieldPath, ResourcePath, DOCUMENT_KEY_NAME};
pub use query::{Bound, Direction, FieldFilter, LimitType, Operator, OrderBy, Query, Target};
pub use sorted_map::{Comparator, Iter as SortedMapIter, SortedMap};
pub use sorted_set::SortedSet;
pub use target_data::{TargetData, TargetPurpose};
pub use target_id_generator::TargetIdGenerator;
pub use types::{BatchId, ListenSequenceNumber, TargetId, User};
pub use value::{FieldValue, ObjectValue, TypeOrder};
pub use version::{SnapshotVersion, Timestamp};
