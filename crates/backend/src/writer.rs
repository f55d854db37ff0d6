//! The single write path shared by live ingestion and backfill.
//!
//! Order per event: recency cache check, store upsert (retried until it
//! succeeds or shutdown), cache put, handlers. The cache is only populated
//! after the store confirms the write, so a cache hit always means durable.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use mxindex_core::Event;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
  backoff::{BackoffPolicy, Cancelled, retry_until_cancelled},
  cache::RecencyCache,
  handler::EventHandler,
  store::{EventStore, UpsertOutcome},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Inserted,
  /// Recency cache hit, the store was not consulted
  CachedDuplicate,
  /// The store already had the identity
  StoredDuplicate,
}

impl WriteOutcome {
  pub fn is_duplicate(&self) -> bool {
    !matches!(self, WriteOutcome::Inserted)
  }
}

pub struct EventWriter {
  cache: Arc<RecencyCache>,
  store: Arc<dyn EventStore>,
  backoff: Arc<dyn BackoffPolicy>,
  handlers: Vec<Arc<dyn EventHandler>>,
  store_retries: AtomicU64,
}

impl EventWriter {
  pub fn new(cache: Arc<RecencyCache>, store: Arc<dyn EventStore>, backoff: Arc<dyn BackoffPolicy>) -> Self {
    Self {
      cache,
      store,
      backoff,
      handlers: Vec::new(),
      store_retries: AtomicU64::new(0),
    }
  }

  pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
    self.handlers.push(handler);
    self
  }

  pub fn cache(&self) -> &Arc<RecencyCache> {
    &self.cache
  }

  pub fn store(&self) -> &Arc<dyn EventStore> {
    &self.store
  }

  pub fn backoff(&self) -> &Arc<dyn BackoffPolicy> {
    &self.backoff
  }

  /// Store upserts that had to be repeated
  pub fn store_retries(&self) -> u64 {
    self.store_retries.load(Ordering::Relaxed)
  }

  /// Write one validated event. Only fails if cancelled while the store is
  /// unavailable, in which case nothing was written.
  pub async fn write(&self, event: &Event, cancel: &CancellationToken) -> Result<WriteOutcome, Cancelled> {
    if self.cache.get(&event.identity).is_some() {
      trace!(identity = %event.identity, "Cache hit, skipping store");
      return Ok(WriteOutcome::CachedDuplicate);
    }

    let store = &self.store;
    let retries = &self.store_retries;
    let outcome = retry_until_cancelled(self.backoff.as_ref(), cancel, "upsert", move |attempt| {
      if attempt > 0 {
        retries.fetch_add(1, Ordering::Relaxed);
      }
      store.upsert(event)
    })
    .await?;

    if outcome == UpsertOutcome::AlreadyPresent {
      return Ok(WriteOutcome::StoredDuplicate);
    }

    self.cache.put(event);
    for handler in &self.handlers {
      if let Err(e) = handler.on_event(event).await {
        warn!(handler = handler.name(), identity = %event.identity, err = %e, "Event handler failed");
      }
    }
    Ok(WriteOutcome::Inserted)
  }
}
