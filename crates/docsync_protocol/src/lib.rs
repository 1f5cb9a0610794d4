//! # docsync Protocol
//!
//! Messages exchanged with the backend over the watch and write streams.
//!
//! This crate provides:
//! - `ListenRequest`/`ListenResponse` for the watch stream
//! - `WriteRequest`/`WriteResponse` for the write stream
//! - The backend status code taxonomy ([`Code`], [`RpcStatus`])
//! - The [`Codec`] trait and its CBOR implementation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;
mod status;

pub use codec::{CborCodec, Codec};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ListenRequest, ListenResponse, TargetChangeKind, WatchTarget, WireDocument, WriteRequest, WriteResponse,
    WriteResult,
};
pub use status::{Code, RpcStatus};
