//! Daemon configuration.
//!
//! A single YAML file points the daemon at the search store, the rules
//! directory, the trigger-state file and the metrics listener:
//!
//! ```yaml
//! elasticsearch:
//!   url: http://localhost:9200
//! rules_dir: /etc/eswatch/rules
//! state_path: /var/lib/eswatch/state.json
//! metrics:
//!   enabled: true
//!   port: 9184
//! ```
//!
//! Rule bundles themselves stay JSON and live under `rules_dir`, one
//! directory per rule (see the rule module).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::LoadError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/eswatch/config.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,
    pub rules_dir: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/eswatch/state.json")
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| LoadError::InvalidConfig(e.to_string()))
    }

    /// Validate the loaded configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<LoadError>> {
        let mut errors = Vec::new();

        if self.elasticsearch.url.is_empty() {
            errors.push(LoadError::InvalidConfig(
                "elasticsearch.url must not be empty".to_string(),
            ));
        } else if !self.elasticsearch.url.starts_with("http://")
            && !self.elasticsearch.url.starts_with("https://")
        {
            errors.push(LoadError::InvalidConfig(format!(
                "elasticsearch.url must be an http(s) URL, got '{}'",
                self.elasticsearch.url
            )));
        }

        if !self.rules_dir.is_dir() {
            errors.push(LoadError::InvalidConfig(format!(
                "rules_dir '{}' is not a directory",
                self.rules_dir.display()
            )));
        }

        if self.state_path.as_os_str().is_empty() {
            errors.push(LoadError::InvalidConfig(
                "state_path must not be empty".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "elasticsearch:\n  url: http://localhost:9200\nrules_dir: /etc/eswatch/rules\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.elasticsearch.url, "http://localhost:9200");
        assert_eq!(config.state_path, default_state_path());
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9184);
    }

    #[test]
    fn loads_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "elasticsearch:\n  url: https://es.internal:9200\n\
             rules_dir: /srv/rules\n\
             state_path: /srv/state.json\n\
             metrics:\n  enabled: false\n  port: 9999\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rules_dir, PathBuf::from("/srv/rules"));
        assert_eq!(config.state_path, PathBuf::from("/srv/state.json"));
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9999);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn bad_yaml_is_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "elasticsearch: [not, a, mapping\n");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, LoadError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "elasticsearch:\n  url: http://localhost:9200\nrules_dir: /r\ntypo_field: 1\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn validate_collects_all_errors() {
        let config = Config {
            elasticsearch: ElasticsearchConfig {
                url: "ftp://wrong".to_string(),
            },
            rules_dir: PathBuf::from("/definitely/not/a/dir"),
            state_path: PathBuf::new(),
            metrics: MetricsConfig::default(),
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn validate_passes_for_good_config() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            elasticsearch: ElasticsearchConfig {
                url: "http://localhost:9200".to_string(),
            },
            rules_dir: dir.path().to_path_buf(),
            state_path: dir.path().join("state.json"),
            metrics: MetricsConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
