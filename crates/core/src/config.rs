//! Configuration system for mxindex.
//!
//! Config priority: environment overrides > user file (~/.config/mxindex/config.toml) > defaults.
//! The configuration is loaded once at startup and is immutable for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

// ============================================================================
// Matrix Configuration
// ============================================================================

/// Homeserver connection and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
  /// Homeserver base URL (e.g. "https://matrix.example.org")
  pub homeserver: String,

  /// Fully qualified user id of the indexer account
  pub user_id: String,

  /// Account password, used only when no access token is configured
  #[serde(skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,

  /// Pre-issued access token (takes precedence over password login)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub access_token: Option<String>,

  /// Device id presented on password login
  pub device_id: String,

  /// Device display name presented on password login
  pub device_name: String,
}

impl Default for MatrixConfig {
  fn default() -> Self {
    Self {
      homeserver: String::new(),
      user_id: String::new(),
      password: None,
      access_token: None,
      device_id: "MXINDEX".to_string(),
      device_name: "Matrix Indexer".to_string(),
    }
  }
}

impl MatrixConfig {
  /// True if either an access token or a password is available
  pub fn has_credentials(&self) -> bool {
    self.access_token.as_ref().is_some_and(|t| !t.is_empty()) || self.password.as_ref().is_some_and(|p| !p.is_empty())
  }
}

// ============================================================================
// Store Configuration
// ============================================================================

/// Durable event store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// LanceDB directory. Defaults to `<data dir>/lancedb` when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,

  /// Compact the events table and refresh its indexes after this many
  /// inserts (0 = never)
  pub optimize_every: usize,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      optimize_every: 1_000,
    }
  }
}

// ============================================================================
// Cache Configuration
// ============================================================================

/// In-memory recency cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of event identities kept in memory
  pub capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { capacity: 10_000 }
  }
}

// ============================================================================
// Stream Configuration
// ============================================================================

/// Real-time sync stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Server-side long-poll timeout for `/sync`. An empty response after this
  /// long is treated as a keep-alive tick.
  pub sync_timeout_ms: u64,

  /// First reconnect delay after a failure
  pub initial_backoff_ms: u64,

  /// Ceiling for the reconnect delay
  pub max_backoff_ms: u64,

  /// Number of undelivered sync batches buffered between stream and ingestion
  pub channel_capacity: usize,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      sync_timeout_ms: 30_000,
      initial_backoff_ms: 1_000,
      max_backoff_ms: 60_000,
      channel_capacity: 1,
    }
  }
}

// ============================================================================
// Backfill Configuration
// ============================================================================

/// Historical backfill settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
  /// Run backfill alongside the real-time stream
  pub enabled: bool,

  /// Events requested per history page
  pub batch_size: usize,

  /// Minimum delay between history page requests (upstream rate limit)
  pub pacing_ms: u64,

  /// Delay between sources when backfilling every joined source in one run
  pub source_delay_ms: u64,

  /// Concurrent backfill walks
  pub workers: usize,

  /// Event budget for a single walk (0 = unlimited)
  pub max_events_per_run: usize,

  /// Wall-clock budget for a single walk in seconds (0 = unlimited)
  pub max_run_secs: u64,
}

impl Default for BackfillConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      batch_size: 100,
      pacing_ms: 100,
      source_delay_ms: 500,
      workers: 2,
      max_events_per_run: 1_000,
      max_run_secs: 0,
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

fn default_log_level() -> String {
  "info".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub matrix: MatrixConfig,

  #[serde(default)]
  pub store: StoreConfig,

  #[serde(default)]
  pub cache: CacheConfig,

  #[serde(default)]
  pub stream: StreamConfig,

  #[serde(default)]
  pub backfill: BackfillConfig,

  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      matrix: MatrixConfig::default(),
      store: StoreConfig::default(),
      cache: CacheConfig::default(),
      stream: StreamConfig::default(),
      backfill: BackfillConfig::default(),
      log_level: default_log_level(),
    }
  }
}

impl Config {
  /// Load the user config file (if present) and apply environment overrides.
  pub fn load() -> Result<Self, ConfigError> {
    let mut config = match Self::user_config_path() {
      Some(path) if path.exists() => Self::from_file(&path)?,
      _ => Self::default(),
    };
    config.apply_env_from(|key| std::env::var(key).ok());
    Ok(config)
  }

  /// Parse a TOML config file
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Apply environment overrides using the given lookup.
  pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MATRIX_HOMESERVER") {
      self.matrix.homeserver = v;
    }
    if let Some(v) = lookup("MATRIX_USER_ID") {
      self.matrix.user_id = v;
    }
    if let Some(v) = lookup("MATRIX_PASSWORD") {
      self.matrix.password = Some(v);
    }
    if let Some(v) = lookup("MATRIX_TOKEN") {
      self.matrix.access_token = Some(v);
    }
    if let Some(v) = lookup("MXINDEX_STORE_PATH") {
      self.store.path = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("LOG_LEVEL") {
      self.log_level = v.to_lowercase();
    }
  }

  /// Check the settings needed to talk to the homeserver and run ingestion.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.matrix.homeserver.trim().is_empty() {
      return Err(ConfigError::Invalid("matrix.homeserver is not set".into()));
    }
    if !self.matrix.has_credentials() {
      return Err(ConfigError::Invalid(
        "either matrix.access_token or matrix.password must be provided".into(),
      ));
    }
    if self.matrix.access_token.is_none() && self.matrix.user_id.trim().is_empty() {
      return Err(ConfigError::Invalid("matrix.user_id is required for password login".into()));
    }
    if self.backfill.batch_size == 0 {
      return Err(ConfigError::Invalid("backfill.batch_size must be greater than 0".into()));
    }
    if self.backfill.workers == 0 {
      return Err(ConfigError::Invalid("backfill.workers must be greater than 0".into()));
    }
    Ok(())
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("mxindex").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("mxindex").join("config.toml"))
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# mxindex configuration
# Place in ~/.config/mxindex/config.toml
# Environment overrides: MATRIX_HOMESERVER, MATRIX_USER_ID, MATRIX_PASSWORD,
# MATRIX_TOKEN, MXINDEX_STORE_PATH, LOG_LEVEL

log_level = "{log_level}"

[matrix]
homeserver = "https://matrix.example.org"
user_id = "@indexer:example.org"
# access_token = ""
# password = ""
device_id = "{device_id}"
device_name = "{device_name}"

[store]
# path = "/var/lib/mxindex/lancedb"
optimize_every = {optimize_every}

[cache]
capacity = {capacity}

[stream]
sync_timeout_ms = {sync_timeout_ms}
initial_backoff_ms = {initial_backoff_ms}
max_backoff_ms = {max_backoff_ms}
channel_capacity = {channel_capacity}

[backfill]
enabled = {enabled}
batch_size = {batch_size}
pacing_ms = {pacing_ms}
source_delay_ms = {source_delay_ms}
workers = {workers}
# 0 disables the budget
max_events_per_run = {max_events_per_run}
max_run_secs = {max_run_secs}
"#,
      log_level = defaults.log_level,
      device_id = defaults.matrix.device_id,
      device_name = defaults.matrix.device_name,
      optimize_every = defaults.store.optimize_every,
      capacity = defaults.cache.capacity,
      sync_timeout_ms = defaults.stream.sync_timeout_ms,
      initial_backoff_ms = defaults.stream.initial_backoff_ms,
      max_backoff_ms = defaults.stream.max_backoff_ms,
      channel_capacity = defaults.stream.channel_capacity,
      enabled = defaults.backfill.enabled,
      batch_size = defaults.backfill.batch_size,
      pacing_ms = defaults.backfill.pacing_ms,
      source_delay_ms = defaults.backfill.source_delay_ms,
      workers = defaults.backfill.workers,
      max_events_per_run = defaults.backfill.max_events_per_run,
      max_run_secs = defaults.backfill.max_run_secs,
    )
  }
}
