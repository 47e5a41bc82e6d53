use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Serialization contract for node output values crossing a process
/// boundary. The coordination layer treats encoded values as opaque bytes;
/// both sides of a fetch must be constructed with the same codec.
pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// Bincode-backed codec for value types with a fixed serde shape.
///
/// Not suitable for `serde_json::Value`, whose self-describing layout
/// bincode cannot decode; use [`JsonCodec`] there.
pub struct BincodeCodec;

impl<V> ValueCodec<V> for BincodeCodec
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::CodecError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(|e| Error::CodecError(e.to_string()))
    }
}

/// JSON codec for engines whose value type is `serde_json::Value`.
pub struct JsonCodec;

impl ValueCodec<serde_json::Value> for JsonCodec {
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::CodecError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::CodecError(e.to_string()))
    }
}
