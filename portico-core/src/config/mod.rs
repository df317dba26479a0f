//! Application configuration.
//!
//! Loaded once at startup from YAML files plus environment overlays into an
//! immutable map of dot-separated keys, then frozen for the process
//! lifetime. The enumerated surface the core consumes is documented on
//! [`ServerSettings`].

mod loader;
pub mod value;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use value::{ConfigValue, FromConfigValue};

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// The requested key was not found in the configuration.
    NotFound(String),
    /// The value could not be converted to the requested type.
    TypeMismatch { key: String, expected: &'static str },
    /// An I/O or YAML parsing error occurred while loading config files.
    Load(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(key) => write!(f, "config key not found: {key}"),
            ConfigError::TypeMismatch { key, expected } => {
                write!(f, "config type mismatch for '{key}': expected {expected}")
            }
            ConfigError::Load(msg) => write!(f, "config load error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Immutable application configuration.
///
/// Resolution order (lowest to highest priority):
/// 1. `portico.yaml` (base)
/// 2. `portico-{profile}.yaml` (profile override)
/// 3. `.env` / `.env.{profile}` files (loaded into the process environment)
/// 4. `PORTICO_*` environment variables (`PORTICO_SERVER_PORT` overrides
///    `server.port`)
///
/// Profile is determined by `PORTICO_PROFILE` > argument > default `"dev"`.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: HashMap<String, ConfigValue>,
    profile: String,
}

impl Config {
    /// Load configuration for the given profile from the working directory.
    pub fn load(profile: &str) -> Result<Config, ConfigError> {
        let active_profile =
            std::env::var("PORTICO_PROFILE").unwrap_or_else(|_| profile.to_string());

        let mut values = HashMap::new();
        loader::load_yaml_file(Path::new("portico.yaml"), &mut values)?;
        let profile_path = format!("portico-{active_profile}.yaml");
        loader::load_yaml_file(Path::new(&profile_path), &mut values)?;

        // .env files never overwrite already-set environment variables.
        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_filename(format!(".env.{active_profile}"));

        // `PORTICO_SERVER_PORT` <-> `server.port`
        for (env_key, env_val) in std::env::vars() {
            if let Some(rest) = env_key.strip_prefix("PORTICO_") {
                if rest == "PROFILE" {
                    continue;
                }
                let config_key = rest.to_lowercase().replace('_', ".");
                values.insert(config_key, ConfigValue::String(env_val));
            }
        }

        Ok(Config {
            values,
            profile: active_profile,
        })
    }

    /// Create a config from a YAML string (useful for testing).
    pub fn from_yaml_str(yaml: &str, profile: &str) -> Result<Config, ConfigError> {
        let mut values = HashMap::new();
        loader::load_yaml_str(yaml, &mut values)?;
        Ok(Config {
            values,
            profile: profile.to_string(),
        })
    }

    /// Create an empty config (useful for testing).
    pub fn empty() -> Config {
        Config {
            values: HashMap::new(),
            profile: "test".to_string(),
        }
    }

    /// Set a value programmatically; only meaningful before startup.
    pub fn set(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_string(), value);
    }

    /// Get a typed value for the given dot-separated key.
    pub fn get<V: FromConfigValue>(&self, key: &str) -> Result<V, ConfigError> {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))?;
        V::from_config_value(value, key)
    }

    /// Get a typed value, returning a default if the key is missing.
    pub fn get_or<V: FromConfigValue>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Raw access for `on|off|<params>` style switches.
    pub fn get_raw(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All keys under a dotted prefix, e.g. `keys_under("apps")` yields
    /// `name` for every `apps.<name>.*` entry.
    pub fn sections_under(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{prefix}.");
        let mut names: Vec<String> = self
            .values
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('.').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// The active profile name.
    pub fn profile(&self) -> &str {
        &self.profile
    }
}

/// The enumerated configuration surface consumed by the server core,
/// resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub reload: bool,
    pub main_app: Option<String>,
    pub workers: usize,
    pub debug: bool,
    pub execution_threads: usize,
    pub execution_processes: usize,
    pub tasks_max_workers: usize,
    pub ws_idle_timeout: Duration,
    pub ws_ping_interval: Duration,
    pub ws_send_queue_depth: usize,
    pub max_body_bytes: usize,
    pub max_connections_per_ip: usize,
    pub request_deadline: Option<Duration>,
    pub body_read_timeout: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> ServerSettings {
        let deadline = config.get_or::<u64>("limits.request_deadline_secs", 0);
        ServerSettings {
            host: config.get_or("server.host", "127.0.0.1".to_string()),
            port: config.get_or("server.port", 8080),
            reload: config.get_or("server.reload", false),
            main_app: config.get("server.main_app").ok(),
            workers: config.get_or("server.workers", 1),
            debug: config.get_or("debug", false),
            execution_threads: config.get_or("execution.threads", 8),
            execution_processes: config.get_or(
                "execution.processes",
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2),
            ),
            tasks_max_workers: config.get_or("tasks.max_workers", 2),
            ws_idle_timeout: Duration::from_secs(config.get_or("ws.idle_timeout", 60)),
            ws_ping_interval: Duration::from_secs(config.get_or("ws.ping_interval", 20)),
            ws_send_queue_depth: config.get_or("ws.send_queue_depth", 256),
            max_body_bytes: config.get_or("limits.max_body_bytes", 16 * 1024 * 1024),
            max_connections_per_ip: config.get_or("limits.max_connections_per_ip", 0),
            request_deadline: (deadline > 0).then(|| Duration::from_secs(deadline)),
            body_read_timeout: Duration::from_secs(
                config.get_or("limits.body_read_timeout_secs", 30),
            ),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings::from_config(&Config::empty())
    }
}
