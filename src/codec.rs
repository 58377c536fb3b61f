// Serialization boundary at the cache edge

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CatalogError;

/// Converts cached payloads to and from the bytes held by the key-value store.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CatalogError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CatalogError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CatalogError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CatalogError::Codec(format!("encode failed: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CatalogError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CatalogError::Codec(format!("decode failed: {}", e)))
    }
}
