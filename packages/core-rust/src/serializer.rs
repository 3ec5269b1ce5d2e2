//! Payload serializer adapters.
//!
//! The host decodes message bodies with a [`Serializer`]. Fields that travel
//! on a separate attachment channel should be marked `#[serde(skip)]` on the
//! payload type so they never enter the serialized envelope.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors from encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("content type {actual} does not match serializer {expected}")]
    ContentType {
        expected: &'static str,
        actual: String,
    },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Converts typed payloads to and from bytes.
pub trait Serializer: Send + Sync + 'static {
    /// Content type label used for wire negotiation.
    fn content_type(&self) -> &'static str;

    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Encode`] if the value cannot be represented.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::Decode`] for malformed or mismatched input.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;

    /// Rejects a transport content type that this serializer cannot read.
    /// A missing content type is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::ContentType`] on mismatch.
    fn check_content_type(&self, content_type: Option<&str>) -> Result<(), SerializerError> {
        match content_type {
            Some(actual) if !actual.eq_ignore_ascii_case(self.content_type()) => {
                Err(SerializerError::ContentType {
                    expected: self.content_type(),
                    actual: actual.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// `application/json` serializer backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MessagePack
// ---------------------------------------------------------------------------

/// `application/msgpack` serializer backed by `rmp-serde`.
///
/// Structs are encoded as maps (named fields) so that payload types can add
/// optional fields without breaking older readers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        rmp_serde::to_vec_named(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        rmp_serde::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}
