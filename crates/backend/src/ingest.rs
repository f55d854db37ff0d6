//! Real-time ingestion.
//!
//! Consumes [`Delivery`]s from the stream client. Rooms in one batch are
//! processed concurrently; events within a room strictly in receipt order so
//! the per-room cursor only moves forward. A batch is acknowledged once every
//! event in it is durable and every touched cursor and timeline gap is saved.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use mxindex_core::{Cursor, Event, EventOrigin, Gap};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
  backfill::BackfillRequest,
  backoff::{Cancelled, retry_until_cancelled},
  matrix::{SourceBatch, SyncBatch},
  stream::Delivery,
  writer::{EventWriter, WriteOutcome},
};

#[derive(Debug, Default)]
pub struct IngestStats {
  received: AtomicU64,
  inserted: AtomicU64,
  duplicates: AtomicU64,
  malformed: AtomicU64,
  batches: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSnapshot {
  pub batches: u64,
  pub received: u64,
  pub inserted: u64,
  pub duplicates: u64,
  pub malformed: u64,
  pub store_retries: u64,
}

/// Per-room result of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOutcome {
  pub received: usize,
  pub inserted: usize,
  pub duplicates: usize,
  pub malformed: usize,
}

pub struct IngestCoordinator {
  writer: Arc<EventWriter>,
  backfill: Option<mpsc::Sender<BackfillRequest>>,
  /// Cursors loaded or written by this process
  cursors: DashMap<String, Cursor>,
  /// Rooms already announced to backfill
  announced: DashSet<String>,
  stats: IngestStats,
}

impl IngestCoordinator {
  pub fn new(writer: Arc<EventWriter>) -> Self {
    Self {
      writer,
      backfill: None,
      cursors: DashMap::new(),
      announced: DashSet::new(),
      stats: IngestStats::default(),
    }
  }

  /// Send new rooms and timeline gaps to the backfill scheduler
  pub fn with_backfill(mut self, requests: mpsc::Sender<BackfillRequest>) -> Self {
    self.backfill = Some(requests);
    self
  }

  pub fn snapshot(&self) -> IngestSnapshot {
    IngestSnapshot {
      batches: self.stats.batches.load(Ordering::Relaxed),
      received: self.stats.received.load(Ordering::Relaxed),
      inserted: self.stats.inserted.load(Ordering::Relaxed),
      duplicates: self.stats.duplicates.load(Ordering::Relaxed),
      malformed: self.stats.malformed.load(Ordering::Relaxed),
      store_retries: self.writer.store_retries(),
    }
  }

  /// Process deliveries until the channel closes or shutdown is requested.
  ///
  /// A batch interrupted by shutdown is dropped unacknowledged, so its
  /// continuation token is never persisted and it is replayed on restart.
  pub async fn run(&self, mut deliveries: mpsc::Receiver<Delivery>, cancel: CancellationToken) {
    info!("Ingestion started");
    loop {
      let delivery = tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        d = deliveries.recv() => match d {
          Some(d) => d,
          None => break,
        },
      };

      match self.process_batch(&delivery.batch, &cancel).await {
        Ok(()) => delivery.acknowledge(),
        Err(Cancelled) => {
          warn!(next = %delivery.batch.next_token, "Shutdown during batch, leaving it unacknowledged");
          break;
        }
      }
    }

    let stats = self.snapshot();
    info!(
      batches = stats.batches,
      received = stats.received,
      inserted = stats.inserted,
      duplicates = stats.duplicates,
      malformed = stats.malformed,
      store_retries = stats.store_retries,
      "Ingestion stopped"
    );
  }

  /// Durably process one sync batch
  pub async fn process_batch(&self, batch: &SyncBatch, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let results = join_all(
      batch
        .sources
        .iter()
        .map(|source| self.process_source(source, &batch.next_token, cancel)),
    )
    .await;

    let mut total = SourceOutcome::default();
    for result in results {
      let outcome = result?;
      total.received += outcome.received;
      total.inserted += outcome.inserted;
      total.duplicates += outcome.duplicates;
      total.malformed += outcome.malformed;
    }

    self.stats.batches.fetch_add(1, Ordering::Relaxed);
    debug!(
      next = %batch.next_token,
      sources = batch.sources.len(),
      received = total.received,
      inserted = total.inserted,
      duplicates = total.duplicates,
      malformed = total.malformed,
      "Batch processed"
    );
    Ok(())
  }

  /// Process one room's slice of a batch in receipt order
  pub async fn process_source(
    &self,
    batch: &SourceBatch,
    token: &str,
    cancel: &CancellationToken,
  ) -> Result<SourceOutcome, Cancelled> {
    let source_id = batch.source_id.as_str();
    let mut cursor = self.load_cursor(source_id, cancel).await?;
    let mut dirty = false;
    let mut outcome = SourceOutcome::default();

    for raw in &batch.events {
      self.stats.received.fetch_add(1, Ordering::Relaxed);
      outcome.received += 1;
      let event = match Event::from_raw(source_id, raw.clone(), EventOrigin::Live) {
        Ok(event) => event,
        Err(e) => {
          warn!(source_id, err = %e, "Dropping malformed event");
          self.stats.malformed.fetch_add(1, Ordering::Relaxed);
          outcome.malformed += 1;
          continue;
        }
      };

      let written = self.writer.write(&event, cancel).await?;
      if written.is_duplicate() {
        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        outcome.duplicates += 1;
        // Only catch the cursor up; a duplicate never refreshes it otherwise
        let lagging = cursor.as_ref().is_none_or(|c| c.lags(&event));
        if !lagging {
          trace!(identity = %event.identity, outcome = ?written, "Duplicate");
          continue;
        }
        debug!(source_id, identity = %event.identity, "Reconciling lagging cursor");
      } else {
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        outcome.inserted += 1;
      }

      dirty |= match cursor.as_mut() {
        Some(c) => c.advance(Some(token), &event),
        None => {
          cursor = Some(Cursor::new(Some(token), &event));
          true
        }
      };
    }

    if dirty && let Some(cursor) = cursor {
      self.save_cursor(cursor, cancel).await?;
    }

    // Recorded before the ack so the hole outlives the in-memory request queue
    if let Some(token) = batch.gap_token() {
      let gap = Gap::new(source_id, token);
      let store = self.writer.store();
      let pending = &gap;
      retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "add_gap", move |_| {
        store.add_gap(pending)
      })
      .await?;
    }

    self.announce(batch).await;
    Ok(outcome)
  }

  async fn load_cursor(&self, source_id: &str, cancel: &CancellationToken) -> Result<Option<Cursor>, Cancelled> {
    if let Some(cursor) = self.cursors.get(source_id) {
      return Ok(Some(cursor.clone()));
    }

    let store = self.writer.store();
    let loaded = retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "load_cursor", move |_| {
      store.latest_cursor(source_id)
    })
    .await?;

    if let Some(cursor) = &loaded {
      self.cursors.insert(source_id.to_string(), cursor.clone());
    }
    Ok(loaded)
  }

  async fn save_cursor(&self, cursor: Cursor, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let store = self.writer.store();
    let pending = &cursor;
    retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "save_cursor", move |_| {
      store.save_cursor(pending)
    })
    .await?;

    trace!(
      source_id = %cursor.source_id,
      last_timestamp = cursor.last_timestamp,
      last_event_id = %cursor.last_event_id,
      "Cursor advanced"
    );
    self.cursors.insert(cursor.source_id.clone(), cursor);
    Ok(())
  }

  /// Tell backfill about rooms seen for the first time and about timeline gaps
  async fn announce(&self, batch: &SourceBatch) {
    let Some(requests) = &self.backfill else {
      return;
    };

    if self.announced.insert(batch.source_id.clone()) {
      let request = BackfillRequest::Source {
        source_id: batch.source_id.clone(),
        prev_batch: batch.prev_batch.clone(),
      };
      if requests.send(request).await.is_err() {
        debug!(source_id = %batch.source_id, "Backfill scheduler gone");
        return;
      }
    }

    if let Some(token) = batch.gap_token() {
      debug!(source_id = %batch.source_id, token, "Limited timeline, requesting gap fill");
      let request = BackfillRequest::Gap {
        source_id: batch.source_id.clone(),
        token: token.to_string(),
      };
      if requests.send(request).await.is_err() {
        debug!(source_id = %batch.source_id, "Backfill scheduler gone");
      }
    }
  }
}
