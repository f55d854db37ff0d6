//! Stats, resync and config commands

use anyhow::{Context, Result, bail};
use mxindex::{open_store, open_store_read_only};
use mxindex_core::Config;
use tracing::info;

use crate::format::format_stats;

const MASK: &str = "********";

pub async fn cmd_stats(config: Config, json: bool) -> Result<()> {
  let store = open_store_read_only(&config).await.context("Failed to open event store")?;
  let stats = store.stats().await.context("Failed to read store statistics")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&stats)?);
  } else {
    print!("{}", format_stats(&stats));
  }
  Ok(())
}

/// Forget the stream token and every cursor. Stored events are kept.
pub async fn cmd_resync(config: Config) -> Result<()> {
  let store = open_store(&config, false).await.context("Failed to open event store")?;
  store
    .reset_stream_state()
    .await
    .context("Failed to reset stream state")?;
  info!("Stream state reset");
  println!("Stream token and cursors cleared; the next run starts a fresh sync");
  Ok(())
}

/// Effective configuration with credentials hidden
fn masked(mut config: Config) -> Config {
  if config.matrix.password.is_some() {
    config.matrix.password = Some(MASK.to_string());
  }
  if config.matrix.access_token.is_some() {
    config.matrix.access_token = Some(MASK.to_string());
  }
  config
}

pub fn cmd_config_show(config: Config) -> Result<()> {
  if let Some(path) = Config::user_config_path() {
    let state = if path.exists() { "" } else { " (not created)" };
    println!("# {}{}", path.display(), state);
  }
  print!("{}", toml::to_string_pretty(&masked(config))?);
  Ok(())
}

pub fn cmd_config_init() -> Result<()> {
  let path = Config::user_config_path().context("Could not determine config directory")?;
  if path.exists() {
    bail!("Config already exists at {}", path.display());
  }

  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
  }
  std::fs::write(&path, Config::generate_template()).with_context(|| format!("Failed to write {}", path.display()))?;
  println!("Created config at {}", path.display());
  Ok(())
}
