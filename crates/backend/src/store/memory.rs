//! In-process event store.
//!
//! Nothing survives the process. Backs `run --ephemeral` and the test suites.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use mxindex_core::{Cursor, Event, EventFilter, Frontier, Gap};
use parking_lot::RwLock;
use tracing::trace;

use super::{EventStore, Result, StoreStats, UpsertOutcome, accumulate_stats, order_by_recency};

#[derive(Debug, Default)]
pub struct MemoryEventStore {
  events: RwLock<HashMap<String, Event>>,
  cursors: RwLock<HashMap<String, Cursor>>,
  frontiers: RwLock<HashMap<String, Frontier>>,
  gaps: RwLock<BTreeMap<(String, String), Gap>>,
  stream_token: RwLock<Option<String>>,
}

impl MemoryEventStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl EventStore for MemoryEventStore {
  async fn upsert(&self, event: &Event) -> Result<UpsertOutcome> {
    let mut events = self.events.write();
    if events.contains_key(&event.identity) {
      return Ok(UpsertOutcome::AlreadyPresent);
    }
    events.insert(event.identity.clone(), event.clone());
    trace!(identity = %event.identity, source_id = %event.source_id, "Inserted");
    Ok(UpsertOutcome::Inserted)
  }

  async fn get(&self, identity: &str) -> Result<Option<Event>> {
    Ok(self.events.read().get(identity).cloned())
  }

  async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<Event>> {
    let matching: Vec<Event> = self
      .events
      .read()
      .values()
      .filter(|e| filter.matches(e))
      .cloned()
      .collect();
    Ok(order_by_recency(matching, limit))
  }

  async fn count(&self) -> Result<usize> {
    Ok(self.events.read().len())
  }

  async fn stats(&self) -> Result<StoreStats> {
    let mut stats = StoreStats::default();
    let mut senders = HashSet::new();
    for e in self.events.read().values() {
      accumulate_stats(&mut stats, &mut senders, &e.source_id, &e.sender, &e.kind);
    }
    Ok(stats)
  }

  async fn latest_cursor(&self, source_id: &str) -> Result<Option<Cursor>> {
    Ok(self.cursors.read().get(source_id).cloned())
  }

  async fn save_cursor(&self, cursor: &Cursor) -> Result<()> {
    self.cursors.write().insert(cursor.source_id.clone(), cursor.clone());
    Ok(())
  }

  async fn earliest_known(&self, source_id: &str) -> Result<Option<(i64, String)>> {
    Ok(
      self
        .events
        .read()
        .values()
        .filter(|e| e.source_id == source_id)
        .min_by_key(|e| e.server_timestamp)
        .map(|e| (e.server_timestamp, e.identity.clone())),
    )
  }

  async fn frontier(&self, source_id: &str) -> Result<Option<Frontier>> {
    Ok(self.frontiers.read().get(source_id).cloned())
  }

  async fn save_frontier(&self, frontier: &Frontier) -> Result<()> {
    self.frontiers.write().insert(frontier.source_id.clone(), frontier.clone());
    Ok(())
  }

  async fn gap(&self, source_id: &str, token: &str) -> Result<Option<Gap>> {
    Ok(self.gaps.read().get(&(source_id.to_string(), token.to_string())).cloned())
  }

  async fn add_gap(&self, gap: &Gap) -> Result<()> {
    self
      .gaps
      .write()
      .entry((gap.source_id.clone(), gap.token.clone()))
      .or_insert_with(|| gap.clone());
    Ok(())
  }

  async fn save_gap(&self, gap: &Gap) -> Result<()> {
    self
      .gaps
      .write()
      .insert((gap.source_id.clone(), gap.token.clone()), gap.clone());
    Ok(())
  }

  async fn remove_gap(&self, source_id: &str, token: &str) -> Result<()> {
    self.gaps.write().remove(&(source_id.to_string(), token.to_string()));
    Ok(())
  }

  async fn pending_gaps(&self) -> Result<Vec<Gap>> {
    let mut gaps: Vec<Gap> = self.gaps.read().values().cloned().collect();
    gaps.sort_by_key(|g| g.updated_at);
    Ok(gaps)
  }

  async fn stream_token(&self) -> Result<Option<String>> {
    Ok(self.stream_token.read().clone())
  }

  async fn save_stream_token(&self, token: &str) -> Result<()> {
    *self.stream_token.write() = Some(token.to_string());
    Ok(())
  }

  async fn reset_stream_state(&self) -> Result<()> {
    *self.stream_token.write() = None;
    self.cursors.write().clear();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use mxindex_core::EventOrigin;
  use serde_json::json;

  use super::*;

  fn event(id: &str, ts: i64) -> Event {
    Event::from_raw(
      "!r:x",
      json!({"event_id": id, "type": "m.room.message", "sender": "@a:x", "origin_server_ts": ts,
             "content": {"body": format!("body {}", id)}}),
      EventOrigin::Live,
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_upsert_twice_reports_already_present() {
    let store = MemoryEventStore::new();
    assert_eq!(store.upsert(&event("$a", 1)).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(store.upsert(&event("$a", 1)).await.unwrap(), UpsertOutcome::AlreadyPresent);
    assert_eq!(store.count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_upserts_insert_once() {
    let store = Arc::new(MemoryEventStore::new());
    let handles: Vec<_> = (0..16)
      .map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.upsert(&event("$race", 1)).await.unwrap() })
      })
      .collect();

    let mut inserted = 0;
    for h in handles {
      if h.await.unwrap().is_inserted() {
        inserted += 1;
      }
    }
    assert_eq!(inserted, 1);
  }

  #[tokio::test]
  async fn test_add_gap_keeps_existing_checkpoint() {
    let store = MemoryEventStore::new();
    let mut gap = Gap::new("!r:x", "p9");
    store.add_gap(&gap).await.unwrap();
    gap.checkpoint("p4");
    store.save_gap(&gap).await.unwrap();

    // A replayed sync batch reports the same gap again
    store.add_gap(&Gap::new("!r:x", "p9")).await.unwrap();
    let stored = store.gap("!r:x", "p9").await.unwrap().unwrap();
    assert_eq!(stored.before_token.as_deref(), Some("p4"));
    assert_eq!(store.pending_gaps().await.unwrap().len(), 1);

    store.remove_gap("!r:x", "p9").await.unwrap();
    assert!(store.pending_gaps().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_query_newest_first_with_limit() {
    let store = MemoryEventStore::new();
    for (id, ts) in [("$a", 1), ("$b", 3), ("$c", 2)] {
      store.upsert(&event(id, ts)).await.unwrap();
    }
    let results = store.query(&EventFilter::All, 2).await.unwrap();
    let ids: Vec<_> = results.iter().map(|e| e.identity.as_str()).collect();
    assert_eq!(ids, vec!["$b", "$c"]);
  }

  #[tokio::test]
  async fn test_earliest_known_and_reset() {
    let store = MemoryEventStore::new();
    store.upsert(&event("$b", 20)).await.unwrap();
    store.upsert(&event("$a", 10)).await.unwrap();
    assert_eq!(store.earliest_known("!r:x").await.unwrap(), Some((10, "$a".to_string())));

    store.save_stream_token("s1").await.unwrap();
    store.save_cursor(&Cursor::new(Some("s1"), &event("$b", 20))).await.unwrap();
    store.reset_stream_state().await.unwrap();
    assert_eq!(store.stream_token().await.unwrap(), None);
    assert!(store.latest_cursor("!r:x").await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 2);
  }
}
