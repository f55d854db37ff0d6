//! Durable event storage.
//!
//! The [`EventStore`] trait is the seam both coordinators write through.
//! `upsert` keyed on event identity is the idempotence primitive: calling it
//! twice for one identity, from any path and concurrently, leaves exactly one
//! record and reports [`UpsertOutcome::AlreadyPresent`] to every caller but
//! one.

mod connection;
mod events;
mod lock;
mod memory;
mod schema;
mod state;
mod stats;

use std::collections::BTreeMap;

use async_trait::async_trait;
use mxindex_core::{Cursor, Event, EventFilter, Frontier, Gap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use connection::LanceEventStore;
pub use lock::StoreLock;
pub use memory::MemoryEventStore;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("LanceDB error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("Arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Store unavailable: {0}")]
  Unavailable(String),
  #[error("Corrupt record: {0}")]
  Corrupt(String),
  #[error("No event store at {}", .0.display())]
  NotFound(std::path::PathBuf),
  #[error("Store is in use by another process (lock held on {})", .0.display())]
  Locked(std::path::PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of an idempotent write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
  Inserted,
  AlreadyPresent,
}

impl UpsertOutcome {
  pub fn is_inserted(&self) -> bool {
    matches!(self, UpsertOutcome::Inserted)
  }
}

/// Aggregate counts over the stored events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
  pub total_events: usize,
  pub message_events: usize,
  pub unique_sources: usize,
  pub unique_senders: usize,
  pub per_source: BTreeMap<String, usize>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
  /// Insert the event unless its identity is already stored
  async fn upsert(&self, event: &Event) -> Result<UpsertOutcome>;

  async fn get(&self, identity: &str) -> Result<Option<Event>>;

  /// Events matching `filter`, newest `server_timestamp` first
  async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<Event>>;

  async fn count(&self) -> Result<usize>;

  async fn stats(&self) -> Result<StoreStats>;

  async fn latest_cursor(&self, source_id: &str) -> Result<Option<Cursor>>;

  async fn save_cursor(&self, cursor: &Cursor) -> Result<()>;

  /// Timestamp and identity of the oldest stored event for a source
  async fn earliest_known(&self, source_id: &str) -> Result<Option<(i64, String)>>;

  async fn frontier(&self, source_id: &str) -> Result<Option<Frontier>>;

  async fn save_frontier(&self, frontier: &Frontier) -> Result<()>;

  async fn gap(&self, source_id: &str, token: &str) -> Result<Option<Gap>>;

  /// Record a gap unless it is already known. Never resets a checkpoint.
  async fn add_gap(&self, gap: &Gap) -> Result<()>;

  /// Insert or replace a gap's checkpoint
  async fn save_gap(&self, gap: &Gap) -> Result<()>;

  async fn remove_gap(&self, source_id: &str, token: &str) -> Result<()>;

  /// Gaps not yet filled, least recently touched first
  async fn pending_gaps(&self) -> Result<Vec<Gap>>;

  /// Last acknowledged stream continuation token
  async fn stream_token(&self) -> Result<Option<String>>;

  async fn save_stream_token(&self, token: &str) -> Result<()>;

  /// Operator resync: forget the stream token and every cursor.
  /// Events, backfill frontiers and pending gaps are kept.
  async fn reset_stream_state(&self) -> Result<()>;
}

/// Fold an event into running stats
pub(crate) fn accumulate_stats(
  stats: &mut StoreStats,
  senders: &mut std::collections::HashSet<String>,
  source_id: &str,
  sender: &str,
  kind: &str,
) {
  stats.total_events += 1;
  if kind == mxindex_core::event::MESSAGE_KIND {
    stats.message_events += 1;
  }
  *stats.per_source.entry(source_id.to_string()).or_insert(0) += 1;
  if !sender.is_empty() {
    senders.insert(sender.to_string());
  }
  stats.unique_sources = stats.per_source.len();
  stats.unique_senders = senders.len();
}

/// Sort newest first and cut to `limit`
pub(crate) fn order_by_recency(mut events: Vec<Event>, limit: usize) -> Vec<Event> {
  events.sort_by(|a, b| {
    b.server_timestamp
      .cmp(&a.server_timestamp)
      .then_with(|| a.identity.cmp(&b.identity))
  });
  events.truncate(limit);
  events
}
