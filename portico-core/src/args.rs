//! Handler argument schemas and binding.
//!
//! Every handler node declares a finite positional-and-keyword schema.
//! Path parameters bind positionally in declaration order; query
//! parameters bind by name. Coercion failures are validation errors that
//! surface before the handler runs.

use portico_codec::{decode_scalar_str, TypedValue};

use crate::error::ServerError;

/// Declared kind of a handler argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
    Float,
    Bool,
    Decimal,
    Date,
    DateTime,
    /// Parsed as a JSON document (object or array).
    Json,
}

impl ArgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgKind::Str => "str",
            ArgKind::Int => "int",
            ArgKind::Float => "float",
            ArgKind::Bool => "bool",
            ArgKind::Decimal => "decimal",
            ArgKind::Date => "date",
            ArgKind::DateTime => "datetime",
            ArgKind::Json => "json",
        }
    }
}

/// One entry of a handler's argument schema.
#[derive(Clone, Debug)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub required: bool,
    pub default: Option<TypedValue>,
}

impl ArgSpec {
    pub fn required(name: &str, kind: ArgKind) -> ArgSpec {
        ArgSpec {
            name: name.to_string(),
            kind,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, kind: ArgKind, default: TypedValue) -> ArgSpec {
        ArgSpec {
            name: name.to_string(),
            kind,
            required: false,
            default: Some(default),
        }
    }
}

/// Arguments bound for one handler invocation, in schema order.
#[derive(Clone, Debug, Default)]
pub struct BoundArgs {
    entries: Vec<(String, TypedValue)>,
}

impl BoundArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: TypedValue) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// String view of an argument, for handlers that take text as-is.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(TypedValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TypedValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Coerce one raw textual value to the declared kind.
///
/// In typed mode, tagged strings are accepted for any kind whose type
/// matches the tag; outside typed mode no suffix is interpreted and plain
/// lexicals are parsed directly.
pub fn coerce(spec: &ArgSpec, raw: &str, typed: bool) -> Result<TypedValue, ServerError> {
    let mismatch = |got: &TypedValue| {
        ServerError::Validation(format!(
            "argument '{}' expects {}, got {}",
            spec.name,
            spec.kind.as_str(),
            got.kind_name()
        ))
    };
    let invalid = || {
        ServerError::Validation(format!(
            "argument '{}' is not a valid {}: {raw:?}",
            spec.name,
            spec.kind.as_str()
        ))
    };

    // In typed mode a tagged value must agree with the declared kind.
    if typed {
        let decoded = decode_scalar_str(raw).map_err(|e| {
            ServerError::Validation(format!("argument '{}': {e}", spec.name))
        })?;
        if !matches!(decoded, TypedValue::Str(_)) {
            return match (spec.kind, &decoded) {
                (ArgKind::Decimal, TypedValue::Decimal(_))
                | (ArgKind::Date, TypedValue::Date(_))
                | (ArgKind::DateTime, TypedValue::DateTime(_))
                | (ArgKind::Int, TypedValue::Int(_))
                | (ArgKind::Bool, TypedValue::Bool(_)) => Ok(decoded),
                _ => Err(mismatch(&decoded)),
            };
        }
    }

    match spec.kind {
        ArgKind::Str => Ok(TypedValue::Str(raw.to_string())),
        ArgKind::Int => raw
            .parse::<i64>()
            .map(TypedValue::Int)
            .map_err(|_| invalid()),
        ArgKind::Float => raw
            .parse::<f64>()
            .map(TypedValue::Float)
            .map_err(|_| invalid()),
        ArgKind::Bool => match raw {
            "true" | "1" => Ok(TypedValue::Bool(true)),
            "false" | "0" => Ok(TypedValue::Bool(false)),
            _ => Err(invalid()),
        },
        ArgKind::Decimal => raw
            .parse()
            .map(TypedValue::Decimal)
            .map_err(|_| invalid()),
        ArgKind::Date => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(TypedValue::Date)
            .map_err(|_| invalid()),
        ArgKind::DateTime => chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| TypedValue::DateTime(dt.with_timezone(&chrono::Utc)))
            .map_err(|_| invalid()),
        ArgKind::Json => serde_json::from_str::<serde_json::Value>(raw)
            .map(TypedValue::from_plain)
            .map_err(|_| invalid()),
    }
}

/// Bind path and query values against a schema.
///
/// `path_args` are consumed positionally in schema order; `query` entries
/// bind by name and win over positional values of the same name. Missing
/// required arguments and unknown query names are validation errors.
pub fn bind_args(
    schema: &[ArgSpec],
    path_args: &[(String, String)],
    query: &[(String, String)],
    typed: bool,
) -> Result<BoundArgs, ServerError> {
    let mut bound = BoundArgs::new();

    for spec in schema {
        let from_query = query.iter().find(|(n, _)| n == &spec.name);
        let from_path = path_args.iter().find(|(n, _)| n == &spec.name);
        let raw = from_query.or(from_path).map(|(_, v)| v.as_str());

        match raw {
            Some(raw) => bound.insert(spec.name.clone(), coerce(spec, raw, typed)?),
            None => match (&spec.default, spec.required) {
                (Some(default), _) => bound.insert(spec.name.clone(), default.clone()),
                (None, false) => bound.insert(spec.name.clone(), TypedValue::Null),
                (None, true) => {
                    return Err(ServerError::Validation(format!(
                        "missing required argument '{}'",
                        spec.name
                    )))
                }
            },
        }
    }

    for (name, _) in query {
        if !schema.iter().any(|s| &s.name == name) {
            return Err(ServerError::Validation(format!(
                "unknown query parameter '{name}'"
            )));
        }
    }

    Ok(bound)
}
