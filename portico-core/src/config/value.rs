/// A configuration value: scalar, list, or display-only passthrough.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<ConfigValue>),
    Null,
}

impl ConfigValue {
    /// Render for diagnostics and `on|off|<params>` style switches.
    pub fn as_display_string(&self) -> String {
        match self {
            ConfigValue::String(s) => s.clone(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::List(items) => items
                .iter()
                .map(|v| v.as_display_string())
                .collect::<Vec<_>>()
                .join(","),
            ConfigValue::Null => String::new(),
        }
    }
}

/// Conversion from a raw config value to a typed one.
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &ConfigValue, key: &str) -> Result<Self, super::ConfigError>;
}

fn mismatch(key: &str, expected: &'static str) -> super::ConfigError {
    super::ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue, _key: &str) -> Result<Self, super::ConfigError> {
        Ok(value.as_display_string())
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue, key: &str) -> Result<Self, super::ConfigError> {
        match value {
            ConfigValue::Bool(b) => Ok(*b),
            ConfigValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Ok(true),
                "false" | "off" | "no" | "0" => Ok(false),
                _ => Err(mismatch(key, "bool")),
            },
            ConfigValue::Int(i) => Ok(*i != 0),
            _ => Err(mismatch(key, "bool")),
        }
    }
}

macro_rules! int_from_config_value {
    ($($ty:ty),*) => {
        $(
            impl FromConfigValue for $ty {
                fn from_config_value(value: &ConfigValue, key: &str) -> Result<Self, super::ConfigError> {
                    match value {
                        ConfigValue::Int(i) => <$ty>::try_from(*i).map_err(|_| mismatch(key, stringify!($ty))),
                        ConfigValue::String(s) => s.parse().map_err(|_| mismatch(key, stringify!($ty))),
                        _ => Err(mismatch(key, stringify!($ty))),
                    }
                }
            }
        )*
    };
}

int_from_config_value!(i64, u64, u32, u16, usize);

impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue, key: &str) -> Result<Self, super::ConfigError> {
        match value {
            ConfigValue::Float(f) => Ok(*f),
            ConfigValue::Int(i) => Ok(*i as f64),
            ConfigValue::String(s) => s.parse().map_err(|_| mismatch(key, "f64")),
            _ => Err(mismatch(key, "f64")),
        }
    }
}

impl FromConfigValue for Vec<String> {
    fn from_config_value(value: &ConfigValue, key: &str) -> Result<Self, super::ConfigError> {
        match value {
            ConfigValue::List(items) => Ok(items.iter().map(|v| v.as_display_string()).collect()),
            ConfigValue::String(s) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            _ => Err(mismatch(key, "list of strings")),
        }
    }
}
