//! Tagged scalar encoding: `"<lexical>::<TAG>"`.
//!
//! The tag rides in the string value itself, so the same scheme works in
//! JSON strings, msgpack strings, and query-string parameters.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

use crate::error::CodecError;
use crate::value::TypedValue;

/// The fixed tag table. Tags are one to three uppercase ASCII letters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// Arbitrary-precision decimal.
    Decimal,
    /// Calendar date, `%Y-%m-%d`.
    Date,
    /// Datetime, UTC-normalized, RFC 3339 with `Z`.
    DateTime,
    /// Wall-clock time, `%H:%M:%S` with optional fraction.
    Time,
    /// Integer outside the JSON-safe 2^53 range.
    Long,
    /// Boolean, for string-only carriers such as query parameters.
    Bool,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Decimal => "N",
            Tag::Date => "D",
            Tag::DateTime => "DHZ",
            Tag::Time => "H",
            Tag::Long => "L",
            Tag::Bool => "B",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Tag> {
        match suffix {
            "N" => Some(Tag::Decimal),
            "D" => Some(Tag::Date),
            "DHZ" => Some(Tag::DateTime),
            "H" => Some(Tag::Time),
            "L" => Some(Tag::Long),
            "B" => Some(Tag::Bool),
            _ => None,
        }
    }
}

const SEP: &str = "::";

/// True when `suffix` has the shape of a tag: 1..=3 uppercase ASCII letters.
fn tag_like(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.len() <= 3
        && suffix.bytes().all(|b| b.is_ascii_uppercase())
}

/// Split `s` at its rightmost `::`, returning `(head, suffix)` when the
/// suffix is tag-shaped.
fn split_tagged(s: &str) -> Option<(&str, &str)> {
    let i = s.rfind(SEP)?;
    let suffix = &s[i + SEP.len()..];
    if tag_like(suffix) {
        Some((&s[..i], suffix))
    } else {
        None
    }
}

/// Encode a literal string for a typed carrier, escaping it if its tail
/// would otherwise be read as a tag. Escaping doubles the separator:
/// `"99.50::N"` travels as `"99.50::::N"`.
pub fn escape_str(s: &str) -> String {
    match split_tagged(s) {
        Some((head, suffix)) => format!("{head}{SEP}{SEP}{suffix}"),
        None => s.to_string(),
    }
}

/// Render a typed scalar as its tagged lexical form.
///
/// `Str` values are escaped as needed; `Null`, `Float`, `Array`, and
/// `Object` are not scalar-taggable and return `Unrepresentable`.
pub fn encode_scalar_str(value: &TypedValue) -> Result<String, CodecError> {
    match value {
        TypedValue::Str(s) => Ok(escape_str(s)),
        TypedValue::Bool(b) => Ok(format!("{b}{SEP}B")),
        TypedValue::Int(i) => Ok(format!("{i}{SEP}L")),
        TypedValue::Decimal(d) => Ok(format!("{d}{SEP}N")),
        TypedValue::Date(d) => Ok(format!("{}{SEP}D", d.format("%Y-%m-%d"))),
        TypedValue::DateTime(dt) => Ok(format!(
            "{}{SEP}DHZ",
            dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )),
        TypedValue::Time(t) => Ok(format!("{}{SEP}H", t.format("%H:%M:%S%.f"))),
        other => Err(CodecError::Unrepresentable(format!(
            "cannot scalar-encode {}",
            other.kind_name()
        ))),
    }
}

/// Decode one string from a typed carrier.
///
/// Returns the parsed scalar for a known tag, the unescaped literal for an
/// escaped string, the string itself when no tag shape is present, and an
/// error for malformed lexicals or unknown tag-shaped suffixes.
pub fn decode_scalar_str(s: &str) -> Result<TypedValue, CodecError> {
    let Some((head, suffix)) = split_tagged(s) else {
        return Ok(TypedValue::Str(s.to_string()));
    };

    // Doubled separator: an escaped literal, not a tag.
    if let Some(stripped) = head.strip_suffix(SEP) {
        return Ok(TypedValue::Str(format!("{stripped}{SEP}{suffix}")));
    }

    let Some(tag) = Tag::from_suffix(suffix) else {
        return Err(CodecError::UnknownTag(suffix.to_string()));
    };

    parse_lexical(tag, head)
}

/// Parse the lexical part of a tagged scalar.
pub fn parse_lexical(tag: Tag, lexical: &str) -> Result<TypedValue, CodecError> {
    let malformed = || CodecError::MalformedTag {
        tag: tag.as_str(),
        lexical: lexical.to_string(),
    };
    match tag {
        Tag::Decimal => lexical
            .parse::<Decimal>()
            .map(TypedValue::Decimal)
            .map_err(|_| malformed()),
        Tag::Long => lexical
            .parse::<i64>()
            .map(TypedValue::Int)
            .map_err(|_| malformed()),
        Tag::Bool => match lexical {
            "true" => Ok(TypedValue::Bool(true)),
            "false" => Ok(TypedValue::Bool(false)),
            _ => Err(malformed()),
        },
        Tag::Date => NaiveDate::parse_from_str(lexical, "%Y-%m-%d")
            .map(TypedValue::Date)
            .map_err(|_| malformed()),
        Tag::DateTime => DateTime::parse_from_rfc3339(lexical)
            .map(|dt| TypedValue::DateTime(dt.with_timezone(&Utc)))
            .map_err(|_| malformed()),
        Tag::Time => NaiveTime::parse_from_str(lexical, "%H:%M:%S%.f")
            .map(TypedValue::Time)
            .map_err(|_| malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_each_tag() {
        assert_eq!(
            decode_scalar_str("99.50::N").unwrap(),
            TypedValue::Decimal("99.50".parse().unwrap())
        );
        assert_eq!(
            decode_scalar_str("2025-01-15::D").unwrap(),
            TypedValue::Date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
        );
        assert_eq!(
            decode_scalar_str("2025-01-15T08:30:00Z::DHZ").unwrap(),
            TypedValue::DateTime(Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap())
        );
        assert_eq!(
            decode_scalar_str("08:30:00::H").unwrap(),
            TypedValue::Time(NaiveTime::from_hms_opt(8, 30, 0).unwrap())
        );
        assert_eq!(
            decode_scalar_str("9007199254740993::L").unwrap(),
            TypedValue::Int(9_007_199_254_740_993)
        );
        assert_eq!(decode_scalar_str("true::B").unwrap(), TypedValue::Bool(true));
    }

    #[test]
    fn untagged_strings_pass_through() {
        assert_eq!(
            decode_scalar_str("hello").unwrap(),
            TypedValue::Str("hello".into())
        );
        // Lowercase suffix is not a tag shape.
        assert_eq!(
            decode_scalar_str("foo::bar").unwrap(),
            TypedValue::Str("foo::bar".into())
        );
        // Too long to be a tag.
        assert_eq!(
            decode_scalar_str("x::ABCD").unwrap(),
            TypedValue::Str("x::ABCD".into())
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(matches!(
            decode_scalar_str("foo::X"),
            Err(CodecError::UnknownTag(t)) if t == "X"
        ));
        assert!(matches!(
            decode_scalar_str("foo::ZZZ"),
            Err(CodecError::UnknownTag(_))
        ));
    }

    #[test]
    fn malformed_lexical_is_an_error() {
        assert!(matches!(
            decode_scalar_str("not-a-number::N"),
            Err(CodecError::MalformedTag { tag: "N", .. })
        ));
        assert!(matches!(
            decode_scalar_str("2025-13-99::D"),
            Err(CodecError::MalformedTag { tag: "D", .. })
        ));
        assert!(matches!(
            decode_scalar_str("yes::B"),
            Err(CodecError::MalformedTag { tag: "B", .. })
        ));
    }

    #[test]
    fn literal_strings_with_tag_tails_round_trip_via_escape() {
        for literal in ["99.50::N", "x:::N", "a::::XY", "::B"] {
            let escaped = escape_str(literal);
            assert_eq!(
                decode_scalar_str(&escaped).unwrap(),
                TypedValue::Str(literal.to_string()),
                "literal {literal:?} escaped as {escaped:?}"
            );
        }
    }

    #[test]
    fn scalar_encode_round_trips() {
        let values = [
            TypedValue::Decimal("12.3400".parse().unwrap()),
            TypedValue::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            TypedValue::DateTime(Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()),
            TypedValue::Time(NaiveTime::from_hms_milli_opt(0, 0, 1, 250).unwrap()),
            TypedValue::Int(i64::MAX),
            TypedValue::Bool(false),
            TypedValue::Str("plain".into()),
        ];
        for v in values {
            let s = encode_scalar_str(&v).unwrap();
            assert_eq!(decode_scalar_str(&s).unwrap(), v, "via {s:?}");
        }
    }
}
