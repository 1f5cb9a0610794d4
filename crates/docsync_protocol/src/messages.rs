//! Watch and write stream messages.

use bytes::Bytes;
use docsync_model::{
    Document, DocumentKey, DocumentState, FieldValue, Mutation, ObjectValue, SnapshotVersion, Target, TargetData,
    TargetId, TargetPurpose,
};
use serde::{Deserialize, Serialize};

use crate::status::RpcStatus;

/// A target as sent to the backend in a listen request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchTarget {
    /// Client-assigned id.
    pub target_id: TargetId,
    /// The query descriptor.
    pub target: Target,
    /// Resume cursor; empty to start from scratch.
    pub resume_token: Bytes,
    /// Why the client listens; sent as a label for diagnostics.
    pub purpose: TargetPurpose,
}

impl WatchTarget {
    /// Builds the wire form of `target_data`.
    pub fn from_target_data(target_data: &TargetData) -> Self {
        Self {
            target_id: target_data.target_id,
            target: target_data.target.clone(),
            resume_token: target_data.resume_token.clone(),
            purpose: target_data.purpose,
        }
    }
}

/// Messages sent on the watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListenRequest {
    /// Starts listening to a target.
    AddTarget(WatchTarget),
    /// Stops listening to a target.
    RemoveTarget(TargetId),
}

/// Kinds of target change reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetChangeKind {
    /// Only the resume token changed.
    NoChange,
    /// The targets were added.
    Added,
    /// The targets were removed, possibly with a cause.
    Removed,
    /// The targets are consistent as of the resume token.
    Current,
    /// The targets must be resent from scratch.
    Reset,
}

/// A document as sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    /// The document key.
    pub key: DocumentKey,
    /// Document contents.
    pub fields: ObjectValue,
    /// Version of the document.
    pub update_time: SnapshotVersion,
}

impl WireDocument {
    /// Creates a wire document.
    pub fn new(key: DocumentKey, fields: ObjectValue, update_time: SnapshotVersion) -> Self {
        Self {
            key,
            fields,
            update_time,
        }
    }

    /// Converts to a synced model document.
    pub fn into_document(self) -> Document {
        Document::new(self.key, self.update_time, self.fields, DocumentState::Synced)
    }
}

/// Messages received on the watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListenResponse {
    /// A change to the state of one or more targets.
    TargetChange {
        /// What happened.
        kind: TargetChangeKind,
        /// Affected targets; empty means every active target.
        target_ids: Vec<TargetId>,
        /// New resume cursor, possibly empty.
        resume_token: Bytes,
        /// Why a target was removed.
        cause: Option<RpcStatus>,
        /// Consistent snapshot version; only set on global snapshots.
        read_time: Option<SnapshotVersion>,
    },
    /// A document was added or updated.
    DocumentChange {
        /// The new document state.
        document: WireDocument,
        /// Targets the document now matches.
        target_ids: Vec<TargetId>,
        /// Targets the document no longer matches.
        removed_target_ids: Vec<TargetId>,
    },
    /// A document was deleted.
    DocumentDelete {
        /// The deleted document.
        key: DocumentKey,
        /// Version of the delete.
        read_time: SnapshotVersion,
        /// Targets the document no longer matches.
        removed_target_ids: Vec<TargetId>,
    },
    /// A document left some targets without being deleted.
    DocumentRemove {
        /// The removed document.
        key: DocumentKey,
        /// Targets the document no longer matches.
        removed_target_ids: Vec<TargetId>,
    },
    /// The number of documents the backend holds for a target.
    ExistenceFilter {
        /// The target.
        target_id: TargetId,
        /// Document count.
        count: usize,
    },
}

impl ListenResponse {
    /// A target change with no cause or read time.
    pub fn target_change(kind: TargetChangeKind, target_ids: Vec<TargetId>, resume_token: Bytes) -> Self {
        Self::TargetChange {
            kind,
            target_ids,
            resume_token,
            cause: None,
            read_time: None,
        }
    }

    /// The global snapshot marker: a `NoChange` for every target at `read_time`.
    pub fn global_snapshot(read_time: SnapshotVersion, resume_token: Bytes) -> Self {
        Self::TargetChange {
            kind: TargetChangeKind::NoChange,
            target_ids: Vec::new(),
            resume_token,
            cause: None,
            read_time: Some(read_time),
        }
    }
}

/// Messages sent on the write stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteRequest {
    /// First message on a new stream.
    Handshake {
        /// Token of the last acknowledged write; empty if none.
        stream_token: Bytes,
    },
    /// One mutation batch, or an empty list to close the stream cleanly.
    Mutations {
        /// Token from the last response.
        stream_token: Bytes,
        /// The writes.
        writes: Vec<Mutation>,
    },
}

/// The result of one write.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteResult {
    /// Version of the written document; absent for writes that did not
    /// change it.
    pub update_time: Option<SnapshotVersion>,
    /// Resolved transform values, in transform order.
    pub transform_results: Option<Vec<FieldValue>>,
}

/// Messages received on the write stream.
///
/// The first response acknowledges the handshake and carries no results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// New stream token.
    pub stream_token: Bytes,
    /// When the batch committed.
    pub commit_time: Option<SnapshotVersion>,
    /// One result per mutation.
    pub write_results: Vec<WriteResult>,
}

impl WriteResponse {
    /// The handshake acknowledgement.
    pub fn handshake(stream_token: Bytes) -> Self {
        Self {
            stream_token,
            commit_time: None,
            write_results: Vec::new(),
        }
    }
}
