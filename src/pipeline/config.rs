//! Pipeline configuration.
//!
//! Covers execution limits, retry policy, the repository location, the
//! dataset catalog, and clock synchronization settings. Values come from
//! defaults, a YAML file, and `NEUROPIPE_*` environment variables, in that
//! order of increasing priority.

use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sync::SyncConfig;
use crate::tasks::qc::DEFAULT_MIN_MATCH_RATIO;

/// Where produced datasets are registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogConfig {
    /// JSON catalog file under a local directory.
    Local { dir: PathBuf },
    /// Remote catalog service.
    Rest {
        base_url: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_catalog_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_catalog_timeout_secs() -> u64 {
    60
}

impl CatalogConfig {
    /// Catalog file used by the local variant.
    pub const LOCAL_CATALOG_FILE: &'static str = "datasets.json";

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            CatalogConfig::Rest { timeout_secs, .. } => Some(Duration::from_secs(*timeout_secs)),
            CatalogConfig::Local { .. } => None,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig::Local {
            dir: PathBuf::from("./catalog"),
        }
    }
}

/// Configuration for the pipeline executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Execution settings
    /// Maximum number of task nodes of one session running concurrently.
    pub max_concurrent_tasks: usize,
    /// Maximum number of sessions processed concurrently by a batch.
    pub max_concurrent_sessions: usize,
    /// Machine-wide permits for heavy tasks (spike sorting and the like).
    pub heavy_task_slots: usize,
    /// Attempts per node within one run.
    pub max_attempts: u32,
    /// Re-run nodes that are already complete.
    pub force: bool,

    // Storage settings
    /// SQLite database holding task state.
    pub database_url: String,
    pub catalog: CatalogConfig,
    /// Version tag for datasets whose output spec declares none.
    pub dataset_version: Version,

    // Synchronization settings
    pub sync: SyncConfig,
    /// Match ratio below which sync QC fails a stream.
    pub min_match_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_concurrent_sessions: 2,
            heavy_task_slots: 1,
            max_attempts: 1,
            force: false,

            database_url: "sqlite://neuropipe.db".to_string(),
            catalog: CatalogConfig::default(),
            dataset_version: Version::new(1, 0, 0),

            sync: SyncConfig::default(),
            min_match_ratio: DEFAULT_MIN_MATCH_RATIO,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from defaults and environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `NEUROPIPE_MAX_CONCURRENT_TASKS`: Concurrent nodes per session (default: 4)
    /// - `NEUROPIPE_MAX_CONCURRENT_SESSIONS`: Concurrent sessions per batch (default: 2)
    /// - `NEUROPIPE_HEAVY_TASK_SLOTS`: Heavy task permits (default: 1)
    /// - `NEUROPIPE_MAX_ATTEMPTS`: Attempts per node per run (default: 1)
    /// - `NEUROPIPE_FORCE`: Re-run complete nodes (default: false)
    /// - `NEUROPIPE_DATABASE_URL`: SQLite URL (default: sqlite://neuropipe.db)
    /// - `NEUROPIPE_CATALOG_DIR`: Local catalog directory
    /// - `NEUROPIPE_CATALOG_URL`: REST catalog base URL (takes precedence over the directory)
    /// - `NEUROPIPE_CATALOG_TOKEN`: REST catalog bearer token
    /// - `NEUROPIPE_CATALOG_TIMEOUT_SECS`: REST catalog timeout (default: 60)
    /// - `NEUROPIPE_DATASET_VERSION`: Default dataset version (default: 1.0.0)
    /// - `NEUROPIPE_SYNC_TOLERANCE_S`: Pulse matching tolerance (default: 0.005)
    /// - `NEUROPIPE_SYNC_MAX_GAP_S`: Gap splitting a pulse stream (default: 60)
    /// - `NEUROPIPE_SYNC_MIN_MATCHED_PULSES`: Matched pulses required (default: 10)
    /// - `NEUROPIPE_MIN_MATCH_RATIO`: Sync QC match ratio (default: 0.9)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Loads a YAML file; missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `NEUROPIPE_*` environment variables on top of this configuration.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("NEUROPIPE_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks = parse_env_value(&val, "NEUROPIPE_MAX_CONCURRENT_TASKS")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_MAX_CONCURRENT_SESSIONS") {
            self.max_concurrent_sessions =
                parse_env_value(&val, "NEUROPIPE_MAX_CONCURRENT_SESSIONS")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_HEAVY_TASK_SLOTS") {
            self.heavy_task_slots = parse_env_value(&val, "NEUROPIPE_HEAVY_TASK_SLOTS")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_MAX_ATTEMPTS") {
            self.max_attempts = parse_env_value(&val, "NEUROPIPE_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_FORCE") {
            self.force = parse_env_bool(&val, "NEUROPIPE_FORCE")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_DATABASE_URL") {
            self.database_url = val;
        }

        // Catalog settings
        if let Ok(val) = std::env::var("NEUROPIPE_CATALOG_DIR") {
            self.catalog = CatalogConfig::Local {
                dir: PathBuf::from(val),
            };
        }

        if let Ok(base_url) = std::env::var("NEUROPIPE_CATALOG_URL") {
            let timeout_secs = match std::env::var("NEUROPIPE_CATALOG_TIMEOUT_SECS") {
                Ok(val) => parse_env_value(&val, "NEUROPIPE_CATALOG_TIMEOUT_SECS")?,
                Err(_) => default_catalog_timeout_secs(),
            };
            self.catalog = CatalogConfig::Rest {
                base_url,
                token: std::env::var("NEUROPIPE_CATALOG_TOKEN").ok(),
                timeout_secs,
            };
        }

        if let Ok(val) = std::env::var("NEUROPIPE_DATASET_VERSION") {
            self.dataset_version = parse_env_value(&val, "NEUROPIPE_DATASET_VERSION")?;
        }

        // Sync settings
        if let Ok(val) = std::env::var("NEUROPIPE_SYNC_TOLERANCE_S") {
            self.sync.tolerance_s = parse_env_value(&val, "NEUROPIPE_SYNC_TOLERANCE_S")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_SYNC_MAX_GAP_S") {
            self.sync.max_gap_s = parse_env_value(&val, "NEUROPIPE_SYNC_MAX_GAP_S")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_SYNC_MIN_MATCHED_PULSES") {
            self.sync.min_matched_pulses =
                parse_env_value(&val, "NEUROPIPE_SYNC_MIN_MATCHED_PULSES")?;
        }

        if let Ok(val) = std::env::var("NEUROPIPE_MIN_MATCH_RATIO") {
            self.min_match_ratio = parse_env_value(&val, "NEUROPIPE_MIN_MATCH_RATIO")?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }

        if self.heavy_task_slots == 0 {
            return Err(ConfigError::ValidationFailed(
                "heavy_task_slots must be greater than 0".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        match &self.catalog {
            CatalogConfig::Rest {
                base_url,
                timeout_secs,
                ..
            } => {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(ConfigError::ValidationFailed(
                        "catalog base_url must be an http(s) URL".to_string(),
                    ));
                }
                if *timeout_secs == 0 {
                    return Err(ConfigError::ValidationFailed(
                        "catalog timeout_secs must be greater than 0".to_string(),
                    ));
                }
            }
            CatalogConfig::Local { dir } => {
                if dir.as_os_str().is_empty() {
                    return Err(ConfigError::ValidationFailed(
                        "catalog dir cannot be empty".to_string(),
                    ));
                }
            }
        }

        if !(0.0..=1.0).contains(&self.min_match_ratio) {
            return Err(ConfigError::ValidationFailed(
                "min_match_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        self.sync.validate()
    }

    /// Builder method to set max concurrent tasks.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    pub fn with_heavy_task_slots(mut self, slots: usize) -> Self {
        self.heavy_task_slots = slots;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_catalog(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_dataset_version(mut self, version: Version) -> Self {
        self.dataset_version = version;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_min_match_ratio(mut self, ratio: f64) -> Self {
        self.min_match_ratio = ratio;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.heavy_task_slots, 1);
        assert_eq!(config.max_attempts, 1);
        assert!(!config.force);
        assert_eq!(config.dataset_version, Version::new(1, 0, 0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_max_concurrent_tasks(8)
            .with_heavy_task_slots(2)
            .with_max_attempts(3)
            .with_force(true)
            .with_database_url("sqlite://test.db")
            .with_min_match_ratio(0.5);

        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.heavy_task_slots, 2);
        assert_eq!(config.max_attempts, 3);
        assert!(config.force);
        assert_eq!(config.database_url, "sqlite://test.db");
        assert!((config.min_match_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validation_invalid_concurrent_tasks() {
        let result = PipelineConfig::default().with_max_concurrent_tasks(0).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_tasks"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = PipelineConfig::default().with_max_attempts(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validation_bad_catalog_url() {
        let config = PipelineConfig::default().with_catalog(CatalogConfig::Rest {
            base_url: "catalog.local".to_string(),
            token: None,
            timeout_secs: 10,
        });
        assert!(config.validate().unwrap_err().to_string().contains("base_url"));
    }

    #[test]
    fn test_validation_checks_sync_settings() {
        let config = PipelineConfig::default().with_sync(SyncConfig::new().with_tolerance(0.0));
        assert!(config.validate().unwrap_err().to_string().contains("tolerance"));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("neuropipe.yaml");
        std::fs::write(
            &path,
            r#"
max_attempts: 2
dataset_version: 2.1.0
catalog:
  kind: rest
  base_url: https://catalog.example.org/api
  token: secret
sync:
  tolerance_s: 0.002
  policies:
    camera:
      model: piecewise_linear
      max_residual_s: 0.01
"#,
        )
        .unwrap();

        let config = PipelineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.dataset_version, Version::new(2, 1, 0));
        assert_eq!(config.catalog.timeout(), Some(Duration::from_secs(60)));
        assert!((config.sync.tolerance_s - 0.002).abs() < f64::EPSILON);
        assert_eq!(config.sync.max_gap_s, 60.0);
        assert_eq!(
            config.sync.policy(crate::sync::DeviceKind::Camera).model,
            crate::sync::FitModel::PiecewiseLinear
        );
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("ON", "test").unwrap());
        assert!(!parse_env_bool("no", "test").unwrap());
        assert!(parse_env_bool("invalid", "test").is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let v: Version = parse_env_value("1.2.3", "NEUROPIPE_DATASET_VERSION").unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
        let err = parse_env_value::<usize>("four", "NEUROPIPE_MAX_CONCURRENT_TASKS").unwrap_err();
        assert!(err.to_string().contains("NEUROPIPE_MAX_CONCURRENT_TASKS"));
    }
}
