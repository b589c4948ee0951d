//! Runtime configuration.
//!
//! Loaded from YAML, then overlaid with environment variables:
//!
//! ```yaml
//! vault_path: /var/lib/keyrelay/keys.json
//! log_dir: /var/lib/keyrelay/logs
//! cache:
//!   mode: ttl
//!   ttl: 15m
//! retry:
//!   max_attempts: 3
//!   min_delay: 500ms
//!   max_delay: 8s
//! request_timeout: 60s
//! providers:
//!   openai:
//!     base_url: https://api.openai.com/v1
//!     default_model: gpt-4o-mini
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use keyrelay_core::CacheMode;

use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Providers with a built-in adapter.
pub const BUILTIN_PROVIDERS: [&str; 3] = ["openai", "anthropic", "gemini"];

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Secret cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// `process`, `disabled` or `ttl`
    pub mode: String,

    /// Required when `mode` is `ttl`
    #[serde(with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            mode: "process".to_string(),
            ttl: None,
        }
    }
}

/// Per-provider endpoint overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// Everything the runtime needs besides the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub vault_path: PathBuf,
    pub log_dir: PathBuf,
    pub cache: CacheSettings,
    pub retry: RetryPolicy,

    /// Deadline for one adapter call
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    pub circuit_breaker: CircuitBreakerConfig,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            vault_path: PathBuf::from("keyrelay/keys.json"),
            log_dir: PathBuf::from("keyrelay/logs"),
            cache: CacheSettings::default(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
            circuit_breaker: CircuitBreakerConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Parse from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load the optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides_from(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup("KEYRELAY_VAULT_PATH") {
            self.vault_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("KEYRELAY_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(mode) = lookup("KEYRELAY_CACHE_MODE") {
            self.cache.mode = mode.trim().to_lowercase();
        }
        if let Some(ttl) = lookup("KEYRELAY_CACHE_TTL") {
            self.cache.ttl = Some(parse_duration("KEYRELAY_CACHE_TTL", &ttl)?);
        }
        if let Some(attempts) = lookup("KEYRELAY_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = attempts.trim().parse().map_err(|_| {
                ConfigError::invalid("KEYRELAY_RETRY_MAX_ATTEMPTS", "expected a positive integer")
            })?;
        }
        if let Some(timeout) = lookup("KEYRELAY_REQUEST_TIMEOUT") {
            self.request_timeout = parse_duration("KEYRELAY_REQUEST_TIMEOUT", &timeout)?;
        }

        let mut names: Vec<String> = BUILTIN_PROVIDERS.iter().map(|s| s.to_string()).collect();
        names.extend(self.providers.keys().cloned());
        names.sort();
        names.dedup();

        for name in names {
            let prefix = name.to_uppercase().replace('-', "_");
            let base_url = lookup(&format!("{prefix}_BASE_URL"));
            let default_model = lookup(&format!("{prefix}_DEFAULT_MODEL"));
            if base_url.is_none() && default_model.is_none() {
                continue;
            }
            let settings = self.providers.entry(name).or_default();
            if base_url.is_some() {
                settings.base_url = base_url;
            }
            if default_model.is_some() {
                settings.default_model = default_model;
            }
        }

        self.validate()
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "retry.min_delay",
                "must not exceed retry.max_delay",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout", "must be positive"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        self.cache_mode()?;
        Ok(())
    }

    /// The vault cache mode described by `cache`.
    pub fn cache_mode(&self) -> Result<CacheMode, ConfigError> {
        match self.cache.mode.as_str() {
            "process" => Ok(CacheMode::ProcessLifetime),
            "disabled" => Ok(CacheMode::Disabled),
            "ttl" => match self.cache.ttl {
                Some(ttl) if !ttl.is_zero() => Ok(CacheMode::Ttl(ttl)),
                _ => Err(ConfigError::invalid("cache.ttl", "required when cache.mode is ttl")),
            },
            other => Err(ConfigError::invalid(
                "cache.mode",
                format!("unknown mode '{other}', expected process, disabled or ttl"),
            )),
        }
    }

    /// Settings for one provider, if configured.
    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

/// Serde adapter for human-readable durations such as `500ms` or `30s`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Like [`duration_str`], for optional fields.
pub mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.cache_mode().unwrap(), CacheMode::ProcessLifetime);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
vault_path: /tmp/keys.json
cache:
  mode: ttl
  ttl: 15m
retry:
  max_attempts: 4
  max_delay: 2s
request_timeout: 20s
providers:
  openai:
    base_url: http://localhost:8080/v1
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.vault_path, PathBuf::from("/tmp/keys.json"));
        assert_eq!(config.log_dir, PathBuf::from("keyrelay/logs"));
        assert_eq!(config.cache_mode().unwrap(), CacheMode::Ttl(Duration::from_secs(900)));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.min_delay, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(
            config.provider("openai").unwrap().base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );
    }

    #[test]
    fn test_ttl_mode_requires_ttl() {
        let err = RuntimeConfig::from_yaml_str("cache:\n  mode: ttl\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "cache.ttl"));
    }

    #[test]
    fn test_unknown_cache_mode_rejected() {
        let err = RuntimeConfig::from_yaml_str("cache:\n  mode: forever\n").unwrap_err();
        assert!(err.to_string().contains("forever"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(RuntimeConfig::from_yaml_str("retry:\n  max_attempts: 0\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides_from(env(&[
                ("KEYRELAY_VAULT_PATH", "/data/keys.json"),
                ("KEYRELAY_CACHE_MODE", "Disabled"),
                ("KEYRELAY_RETRY_MAX_ATTEMPTS", "5"),
                ("KEYRELAY_REQUEST_TIMEOUT", "90s"),
                ("GEMINI_DEFAULT_MODEL", "gemini-1.5-pro"),
                ("ANTHROPIC_BASE_URL", "http://proxy/anthropic"),
                ("OPENAI_DEFAULT_MODEL", ""),
            ]))
            .unwrap();

        assert_eq!(config.vault_path, PathBuf::from("/data/keys.json"));
        assert_eq!(config.cache_mode().unwrap(), CacheMode::Disabled);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(90));
        assert_eq!(
            config.provider("gemini").unwrap().default_model.as_deref(),
            Some("gemini-1.5-pro")
        );
        assert_eq!(
            config.provider("anthropic").unwrap().base_url.as_deref(),
            Some("http://proxy/anthropic")
        );
        assert!(config.provider("openai").is_none());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides_from(env(&[("KEYRELAY_REQUEST_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "KEYRELAY_REQUEST_TIMEOUT")
        );
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyrelay.yaml");
        std::fs::write(&path, "log_dir: /tmp/logs\n").unwrap();

        let config = RuntimeConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/tmp/logs"));

        assert!(matches!(
            RuntimeConfig::from_yaml_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
