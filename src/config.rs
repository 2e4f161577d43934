//! Reconciler configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};
use crate::fallback::DataSource;
use crate::product::DEFAULT_EXPORT_QUERY;

/// Remote endpoints and the local demo dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Product submission endpoint (POST)
    pub submit_products_url: String,
    /// Rates endpoint of the workflow service (GET)
    pub primary_rates_url: String,
    /// Rates endpoint of the alternate data service (GET)
    pub alternate_rates_url: Option<String>,
    /// Envelope JSON file served as the demonstration dataset
    pub demo_envelope_path: Option<PathBuf>,
}

impl EndpointConfig {
    /// Whether `source` has an endpoint or file to fetch from.
    pub fn serves(&self, source: DataSource) -> bool {
        match source {
            DataSource::Primary => !self.primary_rates_url.trim().is_empty(),
            DataSource::Alternate => self
                .alternate_rates_url
                .as_deref()
                .is_some_and(|url| !url.trim().is_empty()),
            DataSource::LocalDemo => self.demo_envelope_path.is_some(),
        }
    }
}

/// Local database settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL, e.g. `sqlite://data/store.db`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    /// Query selecting exportable products
    pub export_query: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://ratesync.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 5000,
            export_query: DEFAULT_EXPORT_QUERY.to_string(),
        }
    }
}

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Name of the database target; single-flight is enforced per target
    pub target: String,

    pub endpoints: EndpointConfig,

    pub database: DatabaseConfig,

    /// Attempts per remote operation, including the first
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    pub backoff_ms: u64,

    /// Backoff multiplier applied per retry
    pub backoff_factor: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Timeout for rate fetches in milliseconds
    pub fetch_timeout_ms: u64,

    /// Timeout for product submission in milliseconds
    pub submit_timeout_ms: u64,

    /// Order in which data sources are tried
    pub fallback_order: Vec<DataSource>,

    /// Terminal runs kept in memory for inspection
    pub history_limit: usize,

    /// Version reported in identity headers; defaults to the crate version
    pub client_version: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            target: "default".to_string(),
            endpoints: EndpointConfig::default(),
            database: DatabaseConfig::default(),
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 10000,
            fetch_timeout_ms: 30000,  // 30 seconds
            submit_timeout_ms: 60000, // product lists can be large
            fallback_order: vec![
                DataSource::Primary,
                DataSource::Alternate,
                DataSource::LocalDemo,
            ],
            history_limit: 20,
            client_version: None,
        }
    }
}

impl ReconcilerConfig {
    /// Parse from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ReconcileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `fallback_order` without the sources that have nothing configured.
    pub fn configured_fallback_order(&self) -> Vec<DataSource> {
        self.fallback_order
            .iter()
            .copied()
            .filter(|source| self.endpoints.serves(*source))
            .collect()
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(ReconcileError::Config("target must not be empty".into()));
        }
        if self.endpoints.submit_products_url.trim().is_empty() {
            return Err(ReconcileError::Config(
                "endpoints.submit_products_url is required".into(),
            ));
        }
        if self.endpoints.primary_rates_url.trim().is_empty() {
            return Err(ReconcileError::Config(
                "endpoints.primary_rates_url is required".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ReconcileError::Config("max_attempts must be at least 1".into()));
        }
        if self.fallback_order.is_empty() {
            return Err(ReconcileError::Config(
                "fallback_order must name at least one source".into(),
            ));
        }
        Ok(())
    }
}
