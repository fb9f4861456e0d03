//! Picker Configuration
//!
//! TOML configuration for the endpoint picker, by default read from
//! `$XDG_CONFIG_HOME/endpoint-picker/picker.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments
//! 2. Environment variables (resolved by the daemon's argument parser)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [pool]
//! namespace = "default"
//! name = "vllm-llama3-8b"
//! membership = "vllm-llama3-8b-endpoints"
//!
//! [reconcile]
//! workers = 2
//! base_delay_ms = 5
//! max_delay_ms = 1000000
//! retry_qps = 50.0
//! retry_burst = 300
//! failure_log_threshold = 5
//!
//! [refresh]
//! interval_ms = 50
//! fetch_timeout_ms = 1000
//!
//! [telemetry]
//! scheme = "http"
//! metrics_path = "/metrics"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datastore::ResourceId;

/// Lowest accepted `reconcile.retry_qps`; one retry every ~17 minutes
pub const MIN_RETRY_QPS: f64 = 0.001;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Cli,
    File,
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Identity of the pool this picker serves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub namespace: String,
    pub name: String,
    /// Membership resource listing the pool's endpoints; defaults to the
    /// pool name
    pub membership: Option<String>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name: String::new(),
            membership: None,
        }
    }
}

/// Work queue and retry settings shared by all reconcile loops
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Workers per reconcile loop
    pub workers: usize,
    /// First retry delay for a failing item
    pub base_delay_ms: u64,
    /// Cap on a single item's retry delay
    pub max_delay_ms: u64,
    /// Aggregate retry rate across all items
    pub retry_qps: f64,
    pub retry_burst: u32,
    /// Consecutive failures after which retries are logged at warn
    pub failure_log_threshold: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
            retry_qps: 50.0,
            retry_burst: 300,
            failure_log_threshold: 5,
        }
    }
}

impl ReconcileConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }
}

/// Telemetry refresh loop settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_ms: u64,
    /// Per-backend scrape timeout
    pub fetch_timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            fetch_timeout_ms: 1000,
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// How backend metrics endpoints are addressed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub scheme: String,
    pub metrics_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            metrics_path: "/metrics".to_string(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickerConfig {
    pub pool: PoolSection,
    pub reconcile: ReconcileConfig,
    pub refresh: RefreshConfig,
    pub telemetry: TelemetryConfig,

    /// File the configuration was loaded from, if any
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
    #[serde(skip)]
    source: ConfigSource,
}

impl PickerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path`; a missing file yields defaults
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        if !exists {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })?;
        let mut config = Self::from_toml_str(&content)?;
        config.config_file_path = Some(path.to_path_buf());
        config.source = ConfigSource::File;

        tracing::info!(path = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    pub fn pool_id(&self) -> ResourceId {
        ResourceId::new(&self.pool.namespace, &self.pool.name)
    }

    /// Membership resource in the pool's namespace
    pub fn membership_id(&self) -> ResourceId {
        let name = self.pool.membership.as_deref().unwrap_or(&self.pool.name);
        ResourceId::new(&self.pool.namespace, name)
    }

    /// Reject values the loops cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.pool.name.is_empty() {
            return invalid("pool.name must be set");
        }
        if self.pool.membership.as_deref() == Some("") {
            return invalid("pool.membership must not be empty");
        }
        if self.reconcile.workers == 0 {
            return invalid("reconcile.workers must be at least 1");
        }
        if self.reconcile.base_delay_ms == 0 {
            return invalid("reconcile.base_delay_ms must be positive");
        }
        if self.reconcile.base_delay_ms > self.reconcile.max_delay_ms {
            return invalid("reconcile.base_delay_ms must not exceed reconcile.max_delay_ms");
        }
        if !(self.reconcile.retry_qps.is_finite() && self.reconcile.retry_qps >= MIN_RETRY_QPS) {
            return invalid("reconcile.retry_qps must be at least 0.001");
        }
        if self.reconcile.retry_burst == 0 {
            return invalid("reconcile.retry_burst must be at least 1");
        }
        if self.refresh.interval_ms == 0 {
            return invalid("refresh.interval_ms must be positive");
        }
        if self.refresh.fetch_timeout_ms == 0 {
            return invalid("refresh.fetch_timeout_ms must be positive");
        }
        if !matches!(self.telemetry.scheme.as_str(), "http" | "https") {
            return invalid("telemetry.scheme must be http or https");
        }
        if !self.telemetry.metrics_path.starts_with('/') {
            return invalid("telemetry.metrics_path must start with '/'");
        }
        Ok(())
    }
}

/// Default configuration file path
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("endpoint-picker").join("picker.toml"))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides applied after loading
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub pool_namespace: Option<String>,
    pub pool_name: Option<String>,
    pub membership: Option<String>,
    pub workers: Option<usize>,
    pub refresh_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pool_name(mut self, name: String) -> Self {
        self.pool_name = Some(name);
        self
    }

    #[must_use]
    pub fn with_pool_namespace(mut self, namespace: String) -> Self {
        self.pool_namespace = Some(namespace);
        self
    }

    #[must_use]
    pub fn with_membership(mut self, name: String) -> Self {
        self.membership = Some(name);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub fn with_refresh_interval_ms(mut self, ms: u64) -> Self {
        self.refresh_interval_ms = Some(ms);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pool_namespace.is_none()
            && self.pool_name.is_none()
            && self.membership.is_none()
            && self.workers.is_none()
            && self.refresh_interval_ms.is_none()
    }

    pub fn apply(&self, config: &mut PickerConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(namespace) = &self.pool_namespace {
            config.pool.namespace = namespace.clone();
        }
        if let Some(name) = &self.pool_name {
            config.pool.name = name.clone();
        }
        if let Some(name) = &self.membership {
            config.pool.membership = Some(name.clone());
        }
        if let Some(workers) = self.workers {
            config.reconcile.workers = workers;
        }
        if let Some(ms) = self.refresh_interval_ms {
            config.refresh.interval_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn named() -> PickerConfig {
        let mut config = PickerConfig::default();
        config.pool.name = "pool".to_string();
        config
    }

    #[test]
    fn test_defaults_match_controller_defaults() {
        let config = PickerConfig::default();
        assert_eq!(config.reconcile.workers, 2);
        assert_eq!(config.reconcile.base_delay(), Duration::from_millis(5));
        assert_eq!(config.reconcile.max_delay(), Duration::from_secs(1000));
        assert_eq!(config.reconcile.retry_burst, 300);
        assert_eq!(config.refresh.interval(), Duration::from_millis(50));
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PickerConfig::from_toml_str(
            r#"
            [pool]
            name = "vllm"

            [refresh]
            interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.pool_id(), ResourceId::new("default", "vllm"));
        assert_eq!(config.refresh.interval_ms, 250);
        assert_eq!(config.refresh.fetch_timeout_ms, 1000);
        assert_eq!(config.reconcile, ReconcileConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            PickerConfig::from_toml_str("[pool\nname = 1"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        assert!(PickerConfig::default().validate().is_err());

        let mut config = named();
        config.reconcile.workers = 0;
        assert!(config.validate().is_err());

        let mut config = named();
        config.reconcile.base_delay_ms = 10;
        config.reconcile.max_delay_ms = 1;
        assert!(config.validate().is_err());

        let mut config = named();
        config.reconcile.retry_qps = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = named();
        config.pool.membership = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = named();
        config.telemetry.metrics_path = "metrics".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_vanishing_retry_qps_is_rejected() {
        for qps in [1e-320, f64::MIN_POSITIVE, 0.0005] {
            let mut config = named();
            config.reconcile.retry_qps = qps;
            assert!(config.validate().is_err(), "retry_qps {qps} accepted");
        }

        let mut config = named();
        config.reconcile.retry_qps = MIN_RETRY_QPS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_membership_defaults_to_pool_name() {
        let config = PickerConfig::from_toml_str("[pool]\nname = \"vllm\"\n").unwrap();
        assert_eq!(config.membership_id(), ResourceId::new("default", "vllm"));

        let config = PickerConfig::from_toml_str(
            "[pool]\nnamespace = \"serving\"\nname = \"vllm\"\nmembership = \"vllm-endpoints\"\n",
        )
        .unwrap();
        assert_eq!(
            config.membership_id(),
            ResourceId::new("serving", "vllm-endpoints")
        );
    }

    #[test]
    fn test_overrides_win() {
        let mut config = named();
        ConfigOverrides::new()
            .with_pool_name("other".to_string())
            .with_membership("other-endpoints".to_string())
            .with_workers(8)
            .apply(&mut config);

        assert_eq!(config.pool.name, "other");
        assert_eq!(config.membership_id(), ResourceId::new("default", "other-endpoints"));
        assert_eq!(config.reconcile.workers, 8);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("picker.toml");
        tokio::fs::write(&path, "[pool]\nname = \"from-file\"\n")
            .await
            .unwrap();

        let config = PickerConfig::load(&path).await.unwrap();
        assert_eq!(config.pool.name, "from-file");
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PickerConfig::load(&dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config, PickerConfig::default());
    }
}
