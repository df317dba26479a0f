//! Typed-value codec for Portico.
//!
//! JSON cannot natively carry decimals, dates, datetimes, times, or
//! integers beyond 2^53. This crate encodes those as tagged strings of the
//! form `"<lexical>::<TAG>"` inside an otherwise ordinary JSON (or msgpack)
//! document, and decodes them back losslessly: `decode(encode(x)) == x`.
//!
//! Typed mode is opt-in and signalled by a dedicated media type
//! ([`TYPED_JSON`] / [`TYPED_MSGPACK`]); outside typed mode no suffix is
//! interpreted and native JSON rules apply.

mod binary;
mod error;
mod scalar;
mod value;

pub use binary::{from_typed_msgpack, to_typed_msgpack};
pub use error::CodecError;
pub use scalar::{decode_scalar_str, encode_scalar_str, Tag};
pub use value::{decode_value, encode_value, from_typed_json, to_typed_json, TypedValue};

/// Media type signalling typed mode over a JSON text transport.
pub const TYPED_JSON: &str = "application/vnd.portico+json";

/// Media type signalling typed mode over a msgpack binary transport.
pub const TYPED_MSGPACK: &str = "application/vnd.portico+msgpack";

/// Wire format of a typed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Msgpack,
}

/// Classify a media type string as one of the typed-mode formats.
///
/// Parameters after `;` are ignored, so `application/vnd.portico+json;
/// charset=utf-8` still counts as typed.
pub fn typed_format(media_type: &str) -> Option<WireFormat> {
    let essence = media_type.split(';').next().unwrap_or("").trim();
    if essence.eq_ignore_ascii_case(TYPED_JSON) {
        Some(WireFormat::Json)
    } else if essence.eq_ignore_ascii_case(TYPED_MSGPACK) {
        Some(WireFormat::Msgpack)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_format_matches_with_parameters() {
        assert_eq!(
            typed_format("application/vnd.portico+json; charset=utf-8"),
            Some(WireFormat::Json)
        );
        assert_eq!(typed_format(TYPED_MSGPACK), Some(WireFormat::Msgpack));
        assert_eq!(typed_format("application/json"), None);
        assert_eq!(typed_format("text/plain"), None);
    }
}
