use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::search::OutputFormat;
use crate::error::ConfigError;
use crate::utils::RetryConfig;

pub const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 3072;
pub const DEFAULT_COLLECTION: &str = "bigquery_metadata";
pub const DEFAULT_MAX_TOP_K: u32 = 100;

const APP_DIR: &str = "dbvec";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR).join("config.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join(APP_DIR))
    }

    /// Load the default config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::read_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load_from`], but a missing file means defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Self::load_or_default_with(path, env_var)
    }

    fn load_or_default_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            Self::read_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_with(lookup);
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path().ok_or_else(|| {
            ConfigError::PathError("could not determine config directory".to_string())
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        self.apply_env_with(env_var);
    }

    fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Some(v) = lookup("OPENAI_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("GCP_PROJECT_ID") {
            self.catalog.project_id = Some(v);
        }
        if let Some(v) = lookup("GCP_ACCESS_TOKEN") {
            self.catalog.access_token = Some(v);
        }
        if let Some(v) = lookup("DBVEC_INDEX_PATH") {
            self.index.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DBVEC_COLLECTION") {
            self.index.collection = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            if self.index.driver == IndexDriver::PgVector && self.index.url.is_none() {
                self.index.url = Some(v.clone());
            }
            if self.catalog.driver == CatalogDriver::Postgres && self.catalog.database_url.is_none()
            {
                self.catalog.database_url = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be greater than 0");
        }
        if self.embedding.batch_size == 0 {
            return invalid("embedding.batch_size must be greater than 0");
        }
        if self.extraction.batch_size == 0 {
            return invalid("extraction.batch_size must be greater than 0");
        }
        if self.extraction.concurrency == 0 {
            return invalid("extraction.concurrency must be greater than 0");
        }
        if self.search.max_top_k == 0 {
            return invalid("search.max_top_k must be greater than 0");
        }
        if self.search.default_top_k == 0 || self.search.default_top_k > self.search.max_top_k {
            return invalid("search.default_top_k must be between 1 and search.max_top_k");
        }
        if self.index.collection.is_empty()
            || !self
                .index
                .collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return invalid("index.collection must be non-empty and contain only [A-Za-z0-9_]");
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon.socket_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("{}-{}.sock", APP_DIR, current_uid()))
        })
    }

    pub fn pid_path(&self) -> PathBuf {
        self.socket_path().with_extension("pid")
    }

    pub fn log_path(&self) -> PathBuf {
        Self::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("daemon.log")
    }

    pub fn index_path(&self) -> PathBuf {
        self.index.path.clone().unwrap_or_else(|| {
            Self::data_dir()
                .unwrap_or_else(|| PathBuf::from("./data"))
                .join("index.db")
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// Backoff settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts.max(1))
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogDriver {
    #[default]
    BigQuery,
    Postgres,
    Snapshot,
}

impl std::fmt::Display for CatalogDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogDriver::BigQuery => write!(f, "bigquery"),
            CatalogDriver::Postgres => write!(f, "postgres"),
            CatalogDriver::Snapshot => write!(f, "snapshot"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub driver: CatalogDriver,

    /// Project extracted when a request does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default = "default_bigquery_url")]
    pub api_url: String,

    /// OAuth bearer token for the BigQuery REST API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Connection string for the postgres catalog driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// JSON catalog file for the snapshot driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_catalog_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_bigquery_url() -> String {
    DEFAULT_BIGQUERY_URL.to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_catalog_timeout() -> u64 {
    60
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            driver: CatalogDriver::default(),
            project_id: None,
            api_url: default_bigquery_url(),
            access_token: None,
            database_url: None,
            snapshot_path: None,
            page_size: default_page_size(),
            timeout_secs: default_catalog_timeout(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    #[default]
    OpenAi,
    Tei,
}

impl std::fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProviderKind::OpenAi => write!(f, "openai"),
            EmbeddingProviderKind::Tei => write!(f, "tei"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,

    #[serde(default = "default_embedding_url")]
    pub url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Ask the provider to shorten vectors to `dimension` (OpenAI v3 models).
    #[serde(default)]
    pub send_dimensions: bool,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum texts per provider request.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: u32,

    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_embedding_url() -> String {
    DEFAULT_OPENAI_URL.to_string()
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_embedding_dimension() -> usize {
    DEFAULT_EMBEDDING_DIMENSION
}

fn default_timeout() -> u64 {
    120
}

fn default_embedding_batch_size() -> u32 {
    64
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: None,
            dimension: default_embedding_dimension(),
            send_dimensions: false,
            timeout_secs: default_timeout(),
            batch_size: default_embedding_batch_size(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDriver {
    #[default]
    Sqlite,
    PgVector,
}

impl std::fmt::Display for IndexDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexDriver::Sqlite => write!(f, "sqlite"),
            IndexDriver::PgVector => write!(f, "pgvector"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub driver: IndexDriver,

    /// SQLite file; defaults to `<data_dir>/dbvec/index.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Postgres connection string for the pgvector driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    #[serde(default = "default_pool_acquire_timeout")]
    pub pool_acquire_timeout: u32,
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_pool_max() -> u32 {
    5
}

fn default_pool_acquire_timeout() -> u32 {
    30
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            driver: IndexDriver::default(),
            path: None,
            url: None,
            collection: default_collection(),
            pool_max: default_pool_max(),
            pool_acquire_timeout: default_pool_acquire_timeout(),
        }
    }
}

/// What the pipeline does when an embedding batch exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchErrorPolicy {
    #[default]
    Fail,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Columns accumulated before an embed + append round.
    #[serde(default = "default_extraction_batch_size")]
    pub batch_size: usize,

    /// Tables whose columns are fetched in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub on_batch_error: BatchErrorPolicy,

    /// Finished runs remembered per project.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_extraction_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    4
}

fn default_history_limit() -> usize {
    20
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_extraction_batch_size(),
            concurrency: default_concurrency(),
            on_batch_error: BatchErrorPolicy::default(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: u32,

    #[serde(default = "default_max_top_k")]
    pub max_top_k: u32,

    #[serde(default)]
    pub default_format: OutputFormat,

    #[serde(default)]
    pub default_min_score: Option<f32>,
}

fn default_top_k() -> u32 {
    10
}

fn default_max_top_k() -> u32 {
    DEFAULT_MAX_TOP_K
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            default_format: OutputFormat::Text,
            default_min_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Poll interval used by `extract --wait`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_auto_start() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            auto_start: default_auto_start(),
            socket_path: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.embedding.model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(config.embedding.dimension, 3072);
        assert_eq!(config.index.collection, DEFAULT_COLLECTION);
        assert_eq!(config.search.max_top_k, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.is_some());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [catalog]
            driver = "snapshot"
            snapshot_path = "catalog.json"

            [extraction]
            on_batch_error = "skip"
            "#,
        )
        .unwrap();
        assert_eq!(config.catalog.driver, CatalogDriver::Snapshot);
        assert_eq!(config.catalog.page_size, 1000);
        assert_eq!(config.extraction.on_batch_error, BatchErrorPolicy::Skip);
        assert_eq!(config.extraction.batch_size, 100);
        assert_eq!(config.embedding.retry.max_attempts, 5);
    }

    #[test]
    fn test_validate_rejects_default_above_max() {
        let mut config = Config::default();
        config.search.default_top_k = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_still_validates_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        let config = Config::load_or_default_with(&missing, |_| None).unwrap();
        assert_eq!(config.index.collection, DEFAULT_COLLECTION);

        let result = Config::load_or_default_with(&missing, |key| {
            (key == "DBVEC_COLLECTION").then(|| "bad name".to_string())
        });
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_collection() {
        let mut config = Config::default();
        config.index.collection = "drop table;".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_settings_conversion() {
        let settings = RetrySettings {
            max_attempts: 0,
            ..Default::default()
        };
        let retry = settings.to_retry_config();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_toml_round_trip_hides_secrets_when_absent() {
        let content = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(!content.contains("api_key"));
        assert!(!content.contains("access_token"));
    }
}
