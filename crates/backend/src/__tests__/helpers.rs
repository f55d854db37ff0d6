//! Shared fixtures for the unit tests.
//!
//! `ScriptedSource` plays back sync results and serves room history from
//! in-memory timelines. `FlakyStore` wraps the in-memory store and fails a
//! chosen number of upserts to simulate an outage.

use std::{
  collections::{HashMap, VecDeque},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use mxindex_core::{Cursor, Event, EventFilter, EventOrigin, Frontier, Gap};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::{
  backoff::NoBackoff,
  cache::RecencyCache,
  matrix::{HistoryPage, MessageSource, SourceBatch, SourceError, SyncBatch},
  store::{EventStore, MemoryEventStore, Result as StoreResult, StoreError, StoreStats, UpsertOutcome},
  writer::EventWriter,
};

// ============================================================================
// Events
// ============================================================================

pub fn raw_message(id: &str, ts: i64) -> Value {
  json!({
    "event_id": id,
    "type": "m.room.message",
    "sender": "@alice:x",
    "origin_server_ts": ts,
    "content": {"msgtype": "m.text", "body": format!("message {}", id)},
  })
}

pub fn event(id: &str, room: &str, ts: i64) -> Event {
  Event::from_raw(room, raw_message(id, ts), EventOrigin::Live).expect("valid fixture event")
}

/// One sync response carrying `events` for a single room
pub fn batch_for(token: &str, room: &str, events: Vec<Value>) -> SyncBatch {
  SyncBatch {
    next_token: token.to_string(),
    sources: vec![SourceBatch {
      source_id: room.to_string(),
      events,
      prev_batch: None,
      limited: false,
    }],
  }
}

/// `count` messages with ids `$<prefix><n>` and timestamps `n * 1000`, oldest first
pub fn timeline(prefix: &str, count: usize) -> Vec<Value> {
  (0..count)
    .map(|n| raw_message(&format!("${}{}", prefix, n), n as i64 * 1000))
    .collect()
}

pub fn writer_with(store: Arc<dyn EventStore>, capacity: usize) -> Arc<EventWriter> {
  Arc::new(EventWriter::new(
    Arc::new(RecencyCache::new(capacity)),
    store,
    Arc::new(NoBackoff),
  ))
}

// ============================================================================
// Scripted message source
// ============================================================================

/// History pages use `t<index>` tokens into the room timeline; `None` starts
/// at the live end.
#[derive(Default)]
pub struct ScriptedSource {
  syncs: Mutex<VecDeque<Result<SyncBatch, SourceError>>>,
  sync_log: Mutex<Vec<Option<String>>>,
  sync_called: Notify,
  /// Per room, oldest first
  histories: Mutex<HashMap<String, Vec<Value>>>,
  history_errors: Mutex<VecDeque<SourceError>>,
  history_log: Mutex<Vec<(String, Option<String>)>>,
  joined: Mutex<Vec<String>>,
}

impl ScriptedSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push_sync(&self, result: Result<SyncBatch, SourceError>) {
    self.syncs.lock().push_back(result);
  }

  pub fn sync_calls(&self) -> usize {
    self.sync_log.lock().len()
  }

  /// The `since` token of the `i`th sync request
  pub fn sync_since(&self, i: usize) -> Option<String> {
    self.sync_log.lock().get(i).cloned().flatten()
  }

  pub async fn wait_for_sync_calls(&self, n: usize) {
    loop {
      let notified = self.sync_called.notified();
      if self.sync_calls() >= n {
        return;
      }
      notified.await;
    }
  }

  pub fn set_history(&self, room: &str, events: Vec<Value>) {
    self.histories.lock().insert(room.to_string(), events);
    let mut joined = self.joined.lock();
    if !joined.iter().any(|r| r == room) {
      joined.push(room.to_string());
    }
  }

  /// Fail the next history request with `err`
  pub fn fail_history(&self, err: SourceError) {
    self.history_errors.lock().push_back(err);
  }

  pub fn history_calls(&self) -> usize {
    self.history_log.lock().len()
  }

  /// `before` tokens requested for `room`, in order
  pub fn history_requests(&self, room: &str) -> Vec<Option<String>> {
    self
      .history_log
      .lock()
      .iter()
      .filter(|(r, _)| r == room)
      .map(|(_, before)| before.clone())
      .collect()
  }

  pub fn set_joined(&self, rooms: &[&str]) {
    *self.joined.lock() = rooms.iter().map(|r| r.to_string()).collect();
  }
}

#[async_trait]
impl MessageSource for ScriptedSource {
  async fn next_batch(&self, since: Option<&str>, _timeout: Duration) -> Result<SyncBatch, SourceError> {
    self.sync_log.lock().push(since.map(str::to_string));
    self.sync_called.notify_waiters();

    let next = self.syncs.lock().pop_front();
    match next {
      Some(result) => result,
      // Script exhausted: behave like a long-poll that never returns
      None => std::future::pending().await,
    }
  }

  async fn history(&self, source_id: &str, before: Option<&str>, limit: usize) -> Result<HistoryPage, SourceError> {
    self
      .history_log
      .lock()
      .push((source_id.to_string(), before.map(str::to_string)));

    let injected = self.history_errors.lock().pop_front();
    if let Some(err) = injected {
      return Err(err);
    }

    let histories = self.histories.lock();
    let Some(timeline) = histories.get(source_id) else {
      return Err(SourceError::Rejected(format!("unknown room {}", source_id)));
    };

    let end = match before {
      None => timeline.len(),
      Some(token) => token
        .strip_prefix('t')
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| SourceError::Rejected(format!("bad token {}", token)))?
        .min(timeline.len()),
    };
    let start = end.saturating_sub(limit);
    let events = timeline[start..end].iter().rev().cloned().collect();
    let has_more = start > 0;

    Ok(HistoryPage {
      events,
      next_before_token: has_more.then(|| format!("t{}", start)),
      has_more,
    })
  }

  async fn joined_sources(&self) -> Result<Vec<String>, SourceError> {
    Ok(self.joined.lock().clone())
  }
}

// ============================================================================
// Flaky store
// ============================================================================

/// In-memory store whose upserts can be made to fail
pub struct FlakyStore {
  inner: MemoryEventStore,
  failures_left: AtomicUsize,
  fail_from: AtomicUsize,
  upsert_calls: AtomicUsize,
  upsert_called: Notify,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self {
      inner: MemoryEventStore::new(),
      failures_left: AtomicUsize::new(0),
      fail_from: AtomicUsize::new(usize::MAX),
      upsert_calls: AtomicUsize::new(0),
      upsert_called: Notify::new(),
    }
  }

  /// Fail the next `n` upserts with `StoreError::Unavailable`
  pub fn fail_next_upserts(&self, n: usize) {
    self.failures_left.store(n, Ordering::SeqCst);
  }

  /// Fail every upsert from the `call`th (0-based) onward
  pub fn fail_upserts_from(&self, call: usize) {
    self.fail_from.store(call, Ordering::SeqCst);
  }

  /// End an outage started with `fail_upserts_from`
  pub fn recover(&self) {
    self.fail_from.store(usize::MAX, Ordering::SeqCst);
  }

  pub fn upsert_calls(&self) -> usize {
    self.upsert_calls.load(Ordering::SeqCst)
  }

  pub async fn wait_for_upsert_calls(&self, n: usize) {
    loop {
      let notified = self.upsert_called.notified();
      if self.upsert_calls() >= n {
        return;
      }
      notified.await;
    }
  }
}

#[async_trait]
impl EventStore for FlakyStore {
  async fn upsert(&self, event: &Event) -> StoreResult<UpsertOutcome> {
    let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
    self.upsert_called.notify_waiters();

    let failed = call >= self.fail_from.load(Ordering::SeqCst)
      || self
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
      return Err(StoreError::Unavailable("injected outage".into()));
    }
    self.inner.upsert(event).await
  }

  async fn get(&self, identity: &str) -> StoreResult<Option<Event>> {
    self.inner.get(identity).await
  }

  async fn query(&self, filter: &EventFilter, limit: usize) -> StoreResult<Vec<Event>> {
    self.inner.query(filter, limit).await
  }

  async fn count(&self) -> StoreResult<usize> {
    self.inner.count().await
  }

  async fn stats(&self) -> StoreResult<StoreStats> {
    self.inner.stats().await
  }

  async fn latest_cursor(&self, source_id: &str) -> StoreResult<Option<Cursor>> {
    self.inner.latest_cursor(source_id).await
  }

  async fn save_cursor(&self, cursor: &Cursor) -> StoreResult<()> {
    self.inner.save_cursor(cursor).await
  }

  async fn earliest_known(&self, source_id: &str) -> StoreResult<Option<(i64, String)>> {
    self.inner.earliest_known(source_id).await
  }

  async fn frontier(&self, source_id: &str) -> StoreResult<Option<Frontier>> {
    self.inner.frontier(source_id).await
  }

  async fn save_frontier(&self, frontier: &Frontier) -> StoreResult<()> {
    self.inner.save_frontier(frontier).await
  }

  async fn gap(&self, source_id: &str, token: &str) -> StoreResult<Option<Gap>> {
    self.inner.gap(source_id, token).await
  }

  async fn add_gap(&self, gap: &Gap) -> StoreResult<()> {
    self.inner.add_gap(gap).await
  }

  async fn save_gap(&self, gap: &Gap) -> StoreResult<()> {
    self.inner.save_gap(gap).await
  }

  async fn remove_gap(&self, source_id: &str, token: &str) -> StoreResult<()> {
    self.inner.remove_gap(source_id, token).await
  }

  async fn pending_gaps(&self) -> StoreResult<Vec<Gap>> {
    self.inner.pending_gaps().await
  }

  async fn stream_token(&self) -> StoreResult<Option<String>> {
    self.inner.stream_token().await
  }

  async fn save_stream_token(&self, token: &str) -> StoreResult<()> {
    self.inner.save_stream_token(token).await
  }

  async fn reset_stream_state(&self) -> StoreResult<()> {
    self.inner.reset_stream_state().await
  }
}
