//! Daemon configuration.
//!
//! One YAML mapping, loaded once at startup. Any nested key `a.b` can
//! be overridden from the environment as `INCIDENTD_A_B=value`;
//! unknown keys are errors. Values are parsed as YAML scalars, so
//! quoting forces a string. The runtime configuration (rules, contacts,
//! sources) lives in the database instead and is handled by the
//! runtime cache.

mod logging;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

pub use logging::init_logging;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "INCIDENTD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config file must contain a mapping")]
    NotAMapping,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Listen address of the push listener.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Shared secret protecting the diagnostic endpoints. They are
    /// disabled when unset.
    #[serde(default)]
    pub debug_password: Option<String>,

    /// Directory holding channel plugin executables.
    #[serde(default = "default_channels_dir")]
    pub channels_dir: PathBuf,

    /// Base URL used to build per-incident deep links.
    #[serde(default)]
    pub icingaweb2_url: Option<String>,

    /// Timeout for upstream source API requests.
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub api_timeout: Duration,

    /// How often the runtime configuration tables are reloaded.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub runtime_refresh_interval: Duration,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_listen() -> String {
    "localhost:5680".to_string()
}

fn default_channels_dir() -> PathBuf {
    PathBuf::from("/usr/libexec/incidentd/channels")
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DatabaseConfig {
    /// `memory` is built in; SQL drivers plug in through the database
    /// trait.
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            tls: TlsConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

fn default_driver() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> usize {
    16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Console,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Default level directive, e.g. `info` or `debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,

    /// Flush interval; accepted for compatibility, output is unbuffered.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,

    /// Per-target level overrides, e.g. `incidentd::source: debug`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            interval: None,
            options: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> LogOutput {
    LogOutput::Console
}

impl Config {
    /// Loads the file, applies the environment overlay and validates
    /// the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::from_yaml(&raw, &env)
    }

    /// Parses `raw` and overlays `env` pairs (already filtered to the
    /// prefix). Split out for tests.
    pub fn from_yaml(raw: &str, env: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut tree: Value = serde_yaml::from_str(raw)?;
        if tree.is_null() {
            tree = Value::Mapping(Default::default());
        }
        let Value::Mapping(_) = tree else {
            return Err(ConfigError::NotAMapping);
        };

        // Nested sections must exist as mappings before single path
        // segments can descend into them.
        for section in ["database", "logging"] {
            let map = tree.as_mapping_mut().expect("checked above");
            let key = Value::String(section.to_string());
            if !map.contains_key(&key) {
                map.insert(key, Value::Mapping(Default::default()));
            }
        }

        for (key, value) in env {
            let rest = key.trim_start_matches(ENV_PREFIX);
            let segments: Vec<String> = rest.split('_').map(|s| s.to_lowercase()).collect();
            overlay(&mut tree, &segments, value);
        }

        let config: Config = serde_yaml::from_value(tree)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".into()));
        }
        if self.api_timeout.is_zero() {
            return Err(ConfigError::Invalid("api-timeout must be positive".into()));
        }
        if self.runtime_refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "runtime-refresh-interval must be positive".into(),
            ));
        }
        if self.database.driver != "memory" {
            if self.database.host.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "database driver '{}' requires a host",
                    self.database.driver
                )));
            }
            if self.database.user.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "database driver '{}' requires a user",
                    self.database.driver
                )));
            }
        }
        if let Some(url) = &self.icingaweb2_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(
                    "icingaweb2-url must be an http(s) URL".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Sets `segments` (joined with `-` where they name one kebab-case key)
/// to `value` inside the mapping tree. Keys that match nothing are
/// inserted verbatim; deserialization rejects them as unknown.
fn overlay(node: &mut Value, segments: &[String], value: &str) {
    let Value::Mapping(map) = node else {
        return;
    };
    // Longest joined prefix wins, so LOGGING_LEVEL descends into
    // `logging` while DEBUG_PASSWORD hits the single `debug-password`.
    for take in (1..=segments.len()).rev() {
        let candidate = Value::String(segments[..take].join("-"));
        if let Some(existing) = map.get_mut(&candidate) {
            if take == segments.len() {
                *existing = scalar(value);
            } else {
                overlay(existing, &segments[take..], value);
            }
            return;
        }
    }
    map.insert(Value::String(segments.join("-")), scalar(value));
}

fn scalar(value: &str) -> Value {
    serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_yaml("", &[]).unwrap();
        assert_eq!(config.listen, "localhost:5680");
        assert_eq!(config.api_timeout, Duration::from_secs(60));
        assert_eq!(config.database.driver, "memory");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_values_are_read() {
        let raw = r#"
listen: "0.0.0.0:5680"
debug-password: hunter2
api-timeout: 30s
logging:
  level: debug
  options:
    incidentd::source: trace
"#;
        let config = Config::from_yaml(raw, &[]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:5680");
        assert_eq!(config.debug_password.as_deref(), Some("hunter2"));
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert_eq!(config.logging.options["incidentd::source"], "trace");
    }

    #[test]
    fn environment_overrides_nested_keys() {
        let raw = "logging:\n  level: info\n";
        let config = Config::from_yaml(
            raw,
            &env(&[
                ("INCIDENTD_LOGGING_LEVEL", "debug"),
                ("INCIDENTD_LISTEN", "127.0.0.1:9000"),
                ("INCIDENTD_DEBUG_PASSWORD", "s3cret"),
                ("INCIDENTD_DATABASE_DRIVER", "memory"),
            ]),
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.debug_password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn unknown_keys_are_errors() {
        assert!(Config::from_yaml("nonsense: 1\n", &[]).is_err());
        assert!(Config::from_yaml("", &env(&[("INCIDENTD_NO_SUCH_KEY", "x")])).is_err());
    }

    #[test]
    fn sql_driver_requires_connection_settings() {
        let raw = "database:\n  driver: pgsql\n";
        assert!(Config::from_yaml(raw, &[]).is_err());

        let raw = "database:\n  driver: pgsql\n  host: db1\n  user: incidentd\n";
        assert!(Config::from_yaml(raw, &[]).is_ok());
    }

    #[test]
    fn quoted_env_value_stays_a_string() {
        let config = Config::from_yaml(
            "",
            &env(&[("INCIDENTD_DEBUG_PASSWORD", "\"12345\"")]),
        )
        .unwrap();
        assert_eq!(config.debug_password.as_deref(), Some("12345"));
    }
}
