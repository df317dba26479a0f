use std::collections::HashMap;
use std::path::Path;

use super::value::ConfigValue;
use super::ConfigError;

/// Load a YAML file into the flat dot-keyed map. A missing file is not an
/// error; a present but unparsable file is.
pub fn load_yaml_file(
    path: &Path,
    values: &mut HashMap<String, ConfigValue>,
) -> Result<(), ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(ConfigError::Load(format!(
                "{}: {err}",
                path.display()
            )))
        }
    };
    load_yaml_str(&text, values)
}

/// Load a YAML document string into the flat dot-keyed map.
pub fn load_yaml_str(
    text: &str,
    values: &mut HashMap<String, ConfigValue>,
) -> Result<(), ConfigError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let doc: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))?;
    flatten("", &doc, values);
    Ok(())
}

fn flatten(prefix: &str, value: &serde_yaml::Value, out: &mut HashMap<String, ConfigValue>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                let full = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&full, v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), scalar(other));
        }
    }
}

fn scalar(value: &serde_yaml::Value) -> ConfigValue {
    match value {
        serde_yaml::Value::Null => ConfigValue::Null,
        serde_yaml::Value::Bool(b) => ConfigValue::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ConfigValue::Int(i)
            } else {
                ConfigValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::String(s) => ConfigValue::String(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            ConfigValue::List(items.iter().map(scalar).collect())
        }
        other => ConfigValue::String(
            serde_yaml::to_string(other)
                .unwrap_or_default()
                .trim()
                .to_string(),
        ),
    }
}
