//! Message codecs.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{ListenRequest, ListenResponse, WriteRequest, WriteResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts stream messages to and from bytes.
///
/// The engine treats the codec as opaque; transports decide which codec
/// they speak.
pub trait Codec: Send + Sync {
    /// Encodes a watch request.
    fn encode_listen_request(&self, request: &ListenRequest) -> ProtocolResult<Vec<u8>>;
    /// Decodes a watch request.
    fn decode_listen_request(&self, bytes: &[u8]) -> ProtocolResult<ListenRequest>;
    /// Encodes a watch response.
    fn encode_listen_response(&self, response: &ListenResponse) -> ProtocolResult<Vec<u8>>;
    /// Decodes a watch response.
    fn decode_listen_response(&self, bytes: &[u8]) -> ProtocolResult<ListenResponse>;
    /// Encodes a write request.
    fn encode_write_request(&self, request: &WriteRequest) -> ProtocolResult<Vec<u8>>;
    /// Decodes a write request.
    fn decode_write_request(&self, bytes: &[u8]) -> ProtocolResult<WriteRequest>;
    /// Encodes a write response.
    fn encode_write_response(&self, response: &WriteResponse) -> ProtocolResult<Vec<u8>>;
    /// Decodes a write response.
    fn decode_write_response(&self, bytes: &[u8]) -> ProtocolResult<WriteResponse>;
}

/// CBOR codec built on `ciborium`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    /// Creates the codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn encode<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes).map_err(|e| ProtocolError::encode(e.to_string()))?;
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
    }
}

impl Codec for CborCodec {
    fn encode_listen_request(&self, request: &ListenRequest) -> ProtocolResult<Vec<u8>> {
        Self::encode(request)
    }

    fn decode_listen_request(&self, bytes: &[u8]) -> ProtocolResult<ListenRequest> {
        Self::decode(bytes)
    }

    fn encode_listen_response(&self, response: &ListenResponse) -> ProtocolResult<Vec<u8>> {
        Self::encode(response)
    }

    fn decode_listen_response(&self, bytes: &[u8]) -> ProtocolResult<ListenResponse> {
        Self::decode(bytes)
    }

    fn encode_write_request(&self, request: &WriteRequest) -> ProtocolResult<Vec<u8>> {
        Self::encode(request)
    }

    fn decode_write_request(&self, bytes: &[u8]) -> ProtocolResult<WriteRequest> {
        Self::decode(bytes)
    }

    fn encode_write_response(&self, response: &WriteResponse) -> ProtocolResult<Vec<u8>> {
        Self::encode(response)
    }

    fn decode_write_response(&self, bytes: &[u8]) -> ProtocolResult<WriteResponse> {
        Self::decode(bytes)
    }
}
