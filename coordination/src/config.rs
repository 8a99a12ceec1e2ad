//! Coordinator configuration
//!
//! Defaults, then an optional TOML file, then `COORDINATOR_*` environment
//! variables. The loop threshold is a constant and cannot be configured.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::loop_detector::{DEFAULT_HISTORY_WINDOW, DEFAULT_IDLE_TTL_HOURS};
use crate::oracle::OracleEndpoint;
use crate::similarity::{COLLABORATION_SIMILARITY_THRESHOLD, FAILURE_SIMILARITY_THRESHOLD};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Attempts kept per loop tracker
    pub history_window: usize,

    /// Trackers idle longer than this are collected
    pub tracker_idle_ttl_secs: u64,

    /// Consultations more similar than this count as repeats
    pub collaboration_similarity_threshold: f64,

    /// Failure signatures at least this similar are flagged to the oracle
    pub failure_similarity_threshold: f64,

    /// Directory holding the JSON state file
    pub state_path: PathBuf,

    /// HTTP reasoning oracle; unset means every oracle call is unavailable
    pub oracle: Option<OracleEndpoint>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
            tracker_idle_ttl_secs: DEFAULT_IDLE_TTL_HOURS as u64 * 3600,
            collaboration_similarity_threshold: COLLABORATION_SIMILARITY_THRESHOLD,
            failure_similarity_threshold: FAILURE_SIMILARITY_THRESHOLD,
            state_path: PathBuf::from(".coordination"),
            oracle: None,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (if given) with environment overrides on top
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `COORDINATOR_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COORDINATOR_HISTORY_WINDOW") {
            self.history_window = parse_value("COORDINATOR_HISTORY_WINDOW", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_TRACKER_IDLE_TTL_SECS") {
            self.tracker_idle_ttl_secs = parse_value("COORDINATOR_TRACKER_IDLE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_COLLABORATION_THRESHOLD") {
            self.collaboration_similarity_threshold =
                parse_value("COORDINATOR_COLLABORATION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_FAILURE_THRESHOLD") {
            self.failure_similarity_threshold = parse_value("COORDINATOR_FAILURE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_STATE_PATH") {
            self.state_path = PathBuf::from(v);
        }

        if let Some(url) = lookup("COORDINATOR_ORACLE_URL") {
            let model = lookup("COORDINATOR_ORACLE_MODEL")
                .or_else(|| self.oracle.as_ref().map(|o| o.model.clone()))
                .unwrap_or_else(|| "default".to_string());
            let timeout_secs = match lookup("COORDINATOR_ORACLE_TIMEOUT_SECS") {
                Some(v) => parse_value("COORDINATOR_ORACLE_TIMEOUT_SECS", &v)?,
                None => self.oracle.as_ref().map_or(120, |o| o.timeout_secs),
            };
            let api_key = lookup("COORDINATOR_ORACLE_API_KEY")
                .or_else(|| self.oracle.as_ref().and_then(|o| o.api_key.clone()));
            self.oracle = Some(OracleEndpoint {
                url,
                model,
                api_key,
                timeout_secs,
            });
        } else if let Some(oracle) = self.oracle.as_mut() {
            if let Some(model) = lookup("COORDINATOR_ORACLE_MODEL") {
                oracle.model = model;
            }
            if let Some(key) = lookup("COORDINATOR_ORACLE_API_KEY") {
                oracle.api_key = Some(key);
            }
        }

        Ok(())
    }

    pub fn tracker_idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.tracker_idle_ttl_secs).unwrap_or(i64::MAX))
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.history_window, 10);
        assert_eq!(config.tracker_idle_ttl_secs, 24 * 3600);
        assert!((config.collaboration_similarity_threshold - 0.85).abs() < f64::EPSILON);
        assert!(config.oracle.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CoordinatorConfig::default();
        config
            .apply_env(env(&[
                ("COORDINATOR_HISTORY_WINDOW", "4"),
                ("COORDINATOR_STATE_PATH", "/tmp/coord"),
                ("COORDINATOR_ORACLE_URL", "http://localhost:8080/v1"),
                ("COORDINATOR_ORACLE_MODEL", "judge"),
            ]))
            .unwrap();

        assert_eq!(config.history_window, 4);
        assert_eq!(config.state_path, PathBuf::from("/tmp/coord"));
        let oracle = config.oracle.unwrap();
        assert_eq!(oracle.model, "judge");
        assert_eq!(oracle.timeout_secs, 120);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = CoordinatorConfig::default();
        let err = config
            .apply_env(env(&[("COORDINATOR_HISTORY_WINDOW", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_toml_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.toml");
        std::fs::write(
            &path,
            r#"
history_window = 6
state_path = "state"

[oracle]
url = "http://oracle:9000/v1"
model = "reasoner"
"#,
        )
        .unwrap();

        let config = CoordinatorConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.history_window, 6);
        assert_eq!(config.tracker_idle_ttl_secs, 24 * 3600);
        let oracle = config.oracle.unwrap();
        assert_eq!(oracle.url, "http://oracle:9000/v1");
        assert_eq!(oracle.timeout_secs, 120);
    }

    #[test]
    fn test_toml_round_trip_with_oracle() {
        let mut config = CoordinatorConfig::default();
        config.oracle = Some(OracleEndpoint {
            url: "http://oracle:9000/v1".into(),
            model: "reasoner".into(),
            api_key: None,
            timeout_secs: 30,
        });

        let text = toml::to_string(&config).unwrap();
        let parsed: CoordinatorConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_toml_file_missing() {
        let dir = TempDir::new().unwrap();
        let err = CoordinatorConfig::from_toml_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
