//! The typed value tree and its JSON projection.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};

use crate::error::CodecError;
use crate::scalar::{decode_scalar_str, encode_scalar_str, escape_str};

/// Largest integer magnitude JSON numbers carry exactly (2^53 - 1).
const JSON_SAFE_INT: i64 = 9_007_199_254_740_991;

/// A value that may carry semantic types beyond what JSON natively holds.
///
/// Objects preserve insertion order; that order survives the wire in both
/// the text and binary forms.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Time(NaiveTime),
    Str(String),
    Array(Vec<TypedValue>),
    Object(Vec<(String, TypedValue)>),
}

impl TypedValue {
    /// Short kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TypedValue::Null => "null",
            TypedValue::Bool(_) => "bool",
            TypedValue::Int(_) => "int",
            TypedValue::Float(_) => "float",
            TypedValue::Decimal(_) => "decimal",
            TypedValue::Date(_) => "date",
            TypedValue::DateTime(_) => "datetime",
            TypedValue::Time(_) => "time",
            TypedValue::Str(_) => "string",
            TypedValue::Array(_) => "array",
            TypedValue::Object(_) => "object",
        }
    }

    /// Interpret a plain JSON value with native rules only (no tag scheme).
    pub fn from_plain(value: Value) -> TypedValue {
        match value {
            Value::Null => TypedValue::Null,
            Value::Bool(b) => TypedValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TypedValue::Int(i)
                } else {
                    TypedValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => TypedValue::Str(s),
            Value::Array(items) => {
                TypedValue::Array(items.into_iter().map(TypedValue::from_plain).collect())
            }
            Value::Object(map) => TypedValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, TypedValue::from_plain(v)))
                    .collect(),
            ),
        }
    }

    /// Project to plain JSON for clients that did not ask for typed mode.
    ///
    /// Typed scalars degrade to their lexical strings without tags; this is
    /// lossy by design and never used on a typed round-trip path.
    pub fn to_plain(&self) -> Value {
        match self {
            TypedValue::Null => Value::Null,
            TypedValue::Bool(b) => Value::Bool(*b),
            TypedValue::Int(i) => Value::Number((*i).into()),
            TypedValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            TypedValue::Decimal(d) => Value::String(d.to_string()),
            TypedValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            TypedValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            TypedValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            TypedValue::Str(s) => Value::String(s.clone()),
            TypedValue::Array(items) => Value::Array(items.iter().map(|v| v.to_plain()).collect()),
            TypedValue::Object(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_plain());
                }
                Value::Object(map)
            }
        }
    }
}

/// Encode a typed value into the tagged JSON projection.
///
/// Natively representable scalars (null, bool, safe integers, floats) stay
/// native; everything else becomes a tagged string. Containers recurse.
pub fn encode_value(value: &TypedValue) -> Result<Value, CodecError> {
    Ok(match value {
        TypedValue::Null => Value::Null,
        TypedValue::Bool(b) => Value::Bool(*b),
        TypedValue::Int(i) if i.unsigned_abs() <= JSON_SAFE_INT as u64 => {
            Value::Number((*i).into())
        }
        TypedValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| CodecError::Unrepresentable("non-finite float".into()))?,
        TypedValue::Str(s) => Value::String(escape_str(s)),
        TypedValue::Array(items) => Value::Array(
            items
                .iter()
                .map(encode_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        TypedValue::Object(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), encode_value(v)?);
            }
            Value::Object(map)
        }
        tagged => Value::String(encode_scalar_str(tagged)?),
    })
}

/// Decode the tagged JSON projection back into a typed value.
///
/// Every string is inspected for a tag suffix; malformed or unknown tags
/// are errors, never silent pass-through.
pub fn decode_value(value: &Value) -> Result<TypedValue, CodecError> {
    Ok(match value {
        Value::Null => TypedValue::Null,
        Value::Bool(b) => TypedValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TypedValue::Int(i)
            } else {
                TypedValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => decode_scalar_str(s)?,
        Value::Array(items) => TypedValue::Array(
            items
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                entries.push((k.clone(), decode_value(v)?));
            }
            TypedValue::Object(entries)
        }
    })
}

/// Serialize to typed-mode JSON text.
pub fn to_typed_json(value: &TypedValue) -> Result<String, CodecError> {
    let projected = encode_value(value)?;
    serde_json::to_string(&projected).map_err(|e| CodecError::Json(e.to_string()))
}

/// Deserialize typed-mode JSON text.
pub fn from_typed_json(text: &str) -> Result<TypedValue, CodecError> {
    let parsed: Value = serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))?;
    decode_value(&parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> TypedValue {
        TypedValue::Object(vec![
            ("price".into(), TypedValue::Decimal("99.50".parse().unwrap())),
            (
                "on".into(),
                TypedValue::Date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()),
            ),
            (
                "at".into(),
                TypedValue::DateTime(Utc.with_ymd_and_hms(2025, 1, 15, 9, 0, 0).unwrap()),
            ),
            ("big".into(), TypedValue::Int(9_007_199_254_740_993)),
            ("note".into(), TypedValue::Str("99.50::N".into())),
            (
                "tags".into(),
                TypedValue::Array(vec![TypedValue::Str("a".into()), TypedValue::Null]),
            ),
        ])
    }

    #[test]
    fn json_round_trip() {
        let value = sample();
        let text = to_typed_json(&value).unwrap();
        assert_eq!(from_typed_json(&text).unwrap(), value);
    }

    #[test]
    fn insertion_order_survives_encoding() {
        let text = to_typed_json(&sample()).unwrap();
        let price = text.find("price").unwrap();
        let on = text.find("\"on\"").unwrap();
        let tags = text.find("tags").unwrap();
        assert!(price < on && on < tags);
    }

    #[test]
    fn safe_integers_stay_native() {
        let encoded = encode_value(&TypedValue::Int(42)).unwrap();
        assert_eq!(encoded, Value::Number(42.into()));
        let encoded = encode_value(&TypedValue::Int(9_007_199_254_740_993)).unwrap();
        assert_eq!(encoded, Value::String("9007199254740993::L".into()));
    }

    #[test]
    fn decode_rejects_bad_strings_inside_containers() {
        let doc: Value = serde_json::json!({ "x": ["ok", "nope::Q"] });
        assert!(matches!(
            decode_value(&doc),
            Err(CodecError::UnknownTag(t)) if t == "Q"
        ));
    }

    #[test]
    fn plain_projection_drops_tags() {
        let plain = sample().to_plain();
        assert_eq!(plain["price"], Value::String("99.50".into()));
        assert_eq!(plain["note"], Value::String("99.50::N".into()));
    }
}
