//! CLI command implementations

mod admin;
mod backfill;
mod run;
mod search;

use anyhow::{Context, Result};
use mxindex_core::Config;

pub use admin::{cmd_config_init, cmd_config_show, cmd_resync, cmd_stats};
pub use backfill::cmd_backfill;
pub use run::cmd_run;
pub use search::{SearchQuery, cmd_search};

/// Load the user config with environment overrides
pub fn load_config() -> Result<Config> {
  Config::load().context("Failed to load configuration")
}
