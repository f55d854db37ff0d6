//! Daemon command

use anyhow::{Context, Result};
use mxindex::{Daemon, RuntimeConfig};

/// Run ingestion until ctrl-c or SIGTERM
pub async fn cmd_run(runtime: RuntimeConfig) -> Result<()> {
  Daemon::new(runtime).run().await.context("Daemon stopped with an error")
}
