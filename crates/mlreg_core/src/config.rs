use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

const ENV_HOME: &str = "MLREG_HOME";
const ENV_API_KEY: &str = "MLREG_API_KEY";
const ENV_BIND: &str = "MLREG_BIND";
const ENV_LOG_LEVEL: &str = "MLREG_LOG_LEVEL";

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Registry configuration stored at `<data_dir>/config.json`.
///
/// The API key is **never** written to the JSON file. It is read from the
/// `MLREG_API_KEY` environment variable on every load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Root of the database, model blobs and logs.
    pub data_dir: PathBuf,

    // Server
    pub bind_addr: String,
    pub log_level: String,

    // Training
    pub eval_fraction: f64,
    pub min_split_samples: usize,
    pub split_seed: u64,
    pub default_regressor: String,
    pub default_classifier: String,

    // Retention
    pub prediction_log_retention: usize,
    pub task_retention_days: u32,
    pub task_purge_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            data_dir: Self::default_data_dir(),
            bind_addr: "127.0.0.1:8000".into(),
            log_level: "info".into(),
            eval_fraction: 0.2,
            min_split_samples: 10,
            split_seed: 42,
            default_regressor: "linear_regression".into(),
            default_classifier: "random_forest".into(),
            prediction_log_retention: 10_000,
            task_retention_days: 30,
            task_purge_interval_secs: 86_400,
        }
    }
}

impl RegistryConfig {
    /// `$MLREG_HOME`, falling back to `~/.mlreg`, falling back to `./.mlreg`.
    pub fn default_data_dir() -> PathBuf {
        if let Ok(home) = std::env::var(ENV_HOME) {
            if !home.is_empty() {
                return PathBuf::from(home);
            }
        }
        dirs::home_dir()
            .map(|home| home.join(".mlreg"))
            .unwrap_or_else(|| PathBuf::from(".mlreg"))
    }

    /// Defaults rooted at a specific data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Returns the config file path: `<data_dir>/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Returns the database path: `<data_dir>/registry.db`
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    /// Returns the model blob directory: `<data_dir>/models/`
    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Returns the logs directory: `<data_dir>/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.data_dir.clone(), self.models_dir(), self.logs_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from the default location, creating it if missing.
    pub fn load() -> Result<Self> {
        let path = Self::default().config_path();
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path, writing defaults when the file
    /// does not exist yet. Environment overrides are applied afterwards.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            let mut config = Self::default();
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    config.data_dir = parent.to_path_buf();
                }
            }
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            config
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific file path (the API key is excluded via `#[serde(skip)]`).
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Apply `MLREG_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.api_key = std::env::var(ENV_API_KEY).ok().filter(|k| !k.is_empty());
        if let Ok(bind) = std::env::var(ENV_BIND) {
            if !bind.is_empty() {
                self.bind_addr = bind;
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    /// Reject values the training pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.eval_fraction > 0.0 && self.eval_fraction <= 0.5) {
            anyhow::bail!(
                "eval_fraction must be in (0, 0.5], got {}",
                self.eval_fraction
            );
        }
        if self.min_split_samples < 2 {
            anyhow::bail!(
                "min_split_samples must be at least 2, got {}",
                self.min_split_samples
            );
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("Invalid bind_addr: {}", self.bind_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = RegistryConfig::with_data_dir("/tmp/mlreg-test");
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert!((config.eval_fraction - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.min_split_samples, 10);
        assert_eq!(config.split_seed, 42);
        assert_eq!(config.default_regressor, "linear_regression");
        assert_eq!(config.default_classifier, "random_forest");
        assert_eq!(config.prediction_log_retention, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = RegistryConfig::with_data_dir("/srv/registry");
        assert_eq!(config.db_path(), PathBuf::from("/srv/registry/registry.db"));
        assert_eq!(config.models_dir(), PathBuf::from("/srv/registry/models"));
        assert_eq!(config.logs_dir(), PathBuf::from("/srv/registry/logs"));
        assert_eq!(
            config.config_path(),
            PathBuf::from("/srv/registry/config.json")
        );
    }

    #[test]
    fn load_creates_default_file_rooted_at_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        assert!(!path.exists());

        let config = RegistryConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.data_dir, tmp.path());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = RegistryConfig::with_data_dir(tmp.path());
        config.prediction_log_retention = 25;
        config.default_classifier = "logistic_regression".into();
        config.save_to_path(&path).unwrap();

        let loaded = RegistryConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.prediction_log_retention, 25);
        assert_eq!(loaded.default_classifier, "logistic_regression");
    }

    #[test]
    fn config_json_never_contains_api_key() {
        let mut config = RegistryConfig::with_data_dir("/tmp/x");
        config.api_key = Some("super-secret".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("api_key"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(RegistryConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = RegistryConfig::with_data_dir("/tmp/x");
        config.eval_fraction = 0.9;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::with_data_dir("/tmp/x");
        config.min_split_samples = 1;
        assert!(config.validate().is_err());

        let mut config = RegistryConfig::with_data_dir("/tmp/x");
        config.bind_addr = "not an address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"data_dir":"/tmp/y","split_seed":7}"#).unwrap();
        assert_eq!(config.split_seed, 7);
        assert_eq!(config.min_split_samples, 10);
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RegistryConfig::with_data_dir(tmp.path().join("nested"));
        config.ensure_dirs().unwrap();
        assert!(config.models_dir().is_dir());
        assert!(config.logs_dir().is_dir());
    }
}
