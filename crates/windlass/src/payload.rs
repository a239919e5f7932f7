//! Payload conversion between typed values and opaque bytes
//!
//! Events and commands never store typed values directly. Everything that
//! crosses the history boundary goes through a [`Converter`], so the on-wire
//! encoding stays a property of the deployment rather than of workflow code.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An opaque, serialized value carried in events and commands.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw encoded bytes (base64 on the wire)
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Payload {
    /// Wrap already-encoded bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Number of encoded bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.data) {
            Ok(s) => write!(f, "Payload({s})"),
            Err(_) => write!(f, "Payload({} bytes)", self.data.len()),
        }
    }
}

/// Errors from payload conversion
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// Value could not be serialized
    #[error("failed to serialize value: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Payload could not be deserialized into the requested type
    #[error("failed to deserialize payload: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Converts values to and from [`Payload`]s.
///
/// The trait works on `serde_json::Value` at the seam so it stays object-safe;
/// the generic [`encode`]/[`decode`] helpers bridge to typed values.
pub trait Converter: Send + Sync + 'static {
    /// Encode a JSON value into an opaque payload
    fn to_payload(&self, value: &serde_json::Value) -> Result<Payload, ConversionError>;

    /// Decode an opaque payload back into a JSON value
    fn from_payload(&self, payload: &Payload) -> Result<serde_json::Value, ConversionError>;
}

/// Default converter: plain JSON bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn to_payload(&self, value: &serde_json::Value) -> Result<Payload, ConversionError> {
        let data = serde_json::to_vec(value).map_err(ConversionError::Serialize)?;
        Ok(Payload::new(data))
    }

    fn from_payload(&self, payload: &Payload) -> Result<serde_json::Value, ConversionError> {
        serde_json::from_slice(&payload.data).map_err(ConversionError::Deserialize)
    }
}

/// Encode a typed value through a converter
pub fn encode<T: Serialize>(
    converter: &dyn Converter,
    value: &T,
) -> Result<Payload, ConversionError> {
    let json = serde_json::to_value(value).map_err(ConversionError::Serialize)?;
    converter.to_payload(&json)
}

/// Decode a payload into a typed value through a converter
pub fn decode<T: DeserializeOwned>(
    converter: &dyn Converter,
    payload: &Payload,
) -> Result<T, ConversionError> {
    let json = converter.from_payload(payload)?;
    serde_json::from_value(json).map_err(ConversionError::Deserialize)
}

/// Serde support for payload bytes as base64 strings
mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
