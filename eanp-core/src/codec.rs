//! Pluggable serialization for frames crossing a transport boundary.
//!
//! The [`MessageCodec`] trait lets a transport pick its byte format while the
//! crate provides [`JsonCodec`] for debugging and for the in-process loopback.
//!
//! # Example
//!
//! ```rust
//! use eanp_core::{JsonCodec, Message, MessageCodec};
//!
//! let codec = JsonCodec;
//! let msg = Message::new(1).with("hello");
//!
//! let bytes = codec.encode(&msg).unwrap();
//! let decoded: Message = codec.decode(&bytes).unwrap();
//! assert_eq!(msg, decoded);
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable serialization format.
///
/// Requires `Clone + 'static` so codec instances can be stored inside
/// transports.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable, which makes loopback traces easy to follow, but not meant
/// for throughput.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
