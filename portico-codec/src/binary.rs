//! Binary (msgpack) form of the typed codec.
//!
//! The document structure is msgpack's length-prefixed maps and arrays;
//! the tag scheme rides inside string values exactly as in the text form,
//! so the two transports share one decode path.

use serde_json::Value;

use crate::error::CodecError;
use crate::value::{decode_value, encode_value, TypedValue};

/// Serialize to typed-mode msgpack bytes.
pub fn to_typed_msgpack(value: &TypedValue) -> Result<Vec<u8>, CodecError> {
    let projected = encode_value(value)?;
    rmp_serde::to_vec_named(&projected).map_err(|e| CodecError::Binary(e.to_string()))
}

/// Deserialize typed-mode msgpack bytes.
pub fn from_typed_msgpack(bytes: &[u8]) -> Result<TypedValue, CodecError> {
    let parsed: Value =
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Binary(e.to_string()))?;
    decode_value(&parsed)
}
