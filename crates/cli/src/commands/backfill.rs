//! One-shot backfill command

use std::sync::Arc;

use anyhow::{Context, Result};
use mxindex::{
  backfill::{BackfillCoordinator, Budget},
  backoff::ExponentialBackoff,
  cache::RecencyCache,
  matrix::{MatrixClient, retry_transient},
  open_store,
  writer::EventWriter,
};
use mxindex_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::format::format_backfill;

/// Fill pending gaps and walk history for one room, or every joined room,
/// then exit
pub async fn cmd_backfill(config: Config, room: Option<String>, limit: Option<usize>, json: bool) -> Result<()> {
  config.validate()?;

  let store = open_store(&config, false).await.context("Failed to open event store")?;

  let cancel = CancellationToken::new();
  let ctrl_c = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("Interrupted, saving backfill progress");
      ctrl_c.cancel();
    }
  });

  let backoff = Arc::new(ExponentialBackoff::from_config(&config.stream));
  let login = retry_transient(backoff.as_ref(), &cancel, "login", || MatrixClient::connect(&config.matrix))
    .await
    .context("Failed to log in to the homeserver")?;
  let Some(client) = login else {
    println!("Interrupted before login completed");
    return Ok(());
  };
  info!(user_id = client.user_id(), "Authenticated");

  let writer = Arc::new(EventWriter::new(
    Arc::new(RecencyCache::new(config.cache.capacity)),
    store,
    backoff,
  ));

  let mut budget = Budget::from_config(&config.backfill);
  if let Some(limit) = limit {
    budget.max_events = (limit > 0).then_some(limit);
  }
  let coordinator = BackfillCoordinator::new(Arc::new(client), writer, &config.backfill).with_budget(budget);

  let reports = match room {
    Some(room) => coordinator.backfill_room(&room, &cancel).await,
    None => coordinator
      .backfill_all(&cancel)
      .await
      .context("Failed to list joined rooms")?,
  };

  if json {
    println!("{}", serde_json::to_string_pretty(&reports)?);
  } else {
    print!("{}", format_backfill(&reports));
  }
  Ok(())
}
