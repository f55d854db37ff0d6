use std::path::PathBuf;

use mxindex_core::Config;

/// Get the default base path for mxindex data
///
/// Respects the following environment variables (in order of precedence):
/// 1. DATA_DIR - explicit data directory override
/// 2. XDG_DATA_HOME - standard XDG data home directory
/// 3. dirs::data_local_dir() - platform default
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("mxindex");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("mxindex")
}

/// Directory for the daemon's rolling log files
pub fn default_log_dir() -> PathBuf {
  default_data_dir().join("logs")
}

/// LanceDB directory: `store.path` if configured, otherwise `<data_dir>/lancedb`
pub fn store_path(config: &Config) -> PathBuf {
  config
    .store
    .path
    .clone()
    .unwrap_or_else(|| default_data_dir().join("lancedb"))
}
