// Aggregate statistics over the events table

use std::{collections::HashSet, time::Instant};

use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use tracing::trace;

use super::{Result, StoreStats, accumulate_stats, connection::LanceEventStore, schema::Row};

impl LanceEventStore {
  /// Totals, message count, and per-source counts
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn compute_stats(&self) -> Result<StoreStats> {
    let start = Instant::now();
    let table = self.events_table().await?;

    // Streamed so memory follows the number of rooms and senders, not events
    let mut batches = table
      .query()
      .select(Select::columns(&["source_id", "sender", "kind"]))
      .execute()
      .await?;

    let mut stats = StoreStats::default();
    let mut senders = HashSet::new();
    while let Some(batch) = batches.try_next().await? {
      for i in 0..batch.num_rows() {
        let row = Row::new(&batch, i);
        accumulate_stats(
          &mut stats,
          &mut senders,
          &row.string("source_id")?,
          &row.string("sender")?,
          &row.string("kind")?,
        );
      }
    }

    trace!(
      table = "events",
      operation = "stats",
      total = stats.total_events,
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Event stats computed"
    );

    Ok(stats)
  }
}
