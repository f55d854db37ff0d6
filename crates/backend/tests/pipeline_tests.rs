//! Pipeline integration tests against a LanceDB store on disk
//!
//! Tests: end-to-end ingestion with replay, restart after a crash between
//! store write and cursor save, backfill termination at stored history, and
//! operator resync.

mod common;

use std::sync::Arc;

use mxindex::{
  backfill::{BackfillCoordinator, StopReason, WalkStart},
  backoff::NoBackoff,
  cache::RecencyCache,
  ingest::IngestCoordinator,
  store::{EventStore, LanceEventStore},
  writer::EventWriter,
};
use mxindex_core::{BackfillConfig, Event, EventFilter, EventOrigin};
use tokio_util::sync::CancellationToken;

fn writer(store: Arc<dyn EventStore>) -> Arc<EventWriter> {
  Arc::new(EventWriter::new(Arc::new(RecencyCache::new(1_000)), store, Arc::new(NoBackoff)))
}

#[tokio::test]
async fn test_three_events_then_replay() {
  let dir = common::store_dir();
  let store: Arc<dyn EventStore> = Arc::new(LanceEventStore::open(&dir.path().join("lancedb")).await.unwrap());
  let writer = writer(store.clone());
  let ingest = IngestCoordinator::new(writer.clone());
  let cancel = CancellationToken::new();

  let batch = common::sync_batch(
    "s1",
    "!r:x",
    vec![
      common::message("$A", 1_000),
      common::message("$B", 3_000),
      common::message("$C", 2_000),
    ],
  );

  ingest.process_batch(&batch, &cancel).await.unwrap();
  assert_eq!(store.count().await.unwrap(), 3);
  for id in ["$A", "$B", "$C"] {
    assert!(writer.cache().contains(id), "{} should be cached", id);
  }
  let cursor = store.latest_cursor("!r:x").await.unwrap().expect("cursor saved");
  assert_eq!(cursor.last_timestamp, 3_000);

  // Reconnect replay
  ingest.process_batch(&batch, &cancel).await.unwrap();
  assert_eq!(store.count().await.unwrap(), 3);
  assert_eq!(ingest.snapshot().duplicates, 3);
}

#[tokio::test]
async fn test_restart_after_crash_before_cursor_save() {
  let dir = common::store_dir();
  let path = dir.path().join("lancedb");

  // First process: the event reaches the store, then the process dies
  {
    let store = LanceEventStore::open(&path).await.unwrap();
    let event = Event::from_raw("!r:x", common::message("$A", 5_000), EventOrigin::Live).unwrap();
    store.upsert(&event).await.unwrap();
  }

  // Second process: the stream replays the same batch
  let store: Arc<dyn EventStore> = Arc::new(LanceEventStore::open(&path).await.unwrap());
  assert!(store.latest_cursor("!r:x").await.unwrap().is_none());
  let ingest = IngestCoordinator::new(writer(store.clone()));

  ingest
    .process_batch(
      &common::sync_batch("s1", "!r:x", vec![common::message("$A", 5_000)]),
      &CancellationToken::new(),
    )
    .await
    .unwrap();

  let stats = ingest.snapshot();
  assert_eq!(stats.inserted, 0);
  assert_eq!(stats.duplicates, 1);
  assert_eq!(store.count().await.unwrap(), 1);
  let cursor = store.latest_cursor("!r:x").await.unwrap().expect("cursor reconciled");
  assert_eq!(cursor.last_timestamp, 5_000);
  assert_eq!(cursor.last_event_id, "$A");
}

#[tokio::test]
async fn test_backfill_stops_at_earliest_stored_events() {
  let dir = common::store_dir();
  let store: Arc<dyn EventStore> = Arc::new(LanceEventStore::open(&dir.path().join("lancedb")).await.unwrap());

  let timeline: Vec<_> = (0..300).map(|n| common::message(&format!("$e{}", n), n * 1_000)).collect();
  for raw in &timeline[..50] {
    let event = Event::from_raw("!r:x", raw.clone(), EventOrigin::Live).unwrap();
    store.upsert(&event).await.unwrap();
  }

  let source = Arc::new(common::HistorySource::with_room("!r:x", timeline));
  let config = BackfillConfig {
    batch_size: 50,
    pacing_ms: 0,
    max_events_per_run: 0,
    ..Default::default()
  };
  let backfill = BackfillCoordinator::new(source.clone(), writer(store.clone()), &config);

  let report = backfill
    .backfill_source(
      "!r:x",
      WalkStart::Frontier { seed: None },
      &CancellationToken::new(),
    )
    .await;

  assert_eq!(report.stop, StopReason::ReachedStoredHistory);
  assert_eq!(report.inserted, 250);
  assert_eq!(report.duplicates, 1);
  // Five pages of new history, then the first page of stored history
  assert_eq!(source.requests(), 6);
  assert_eq!(store.count().await.unwrap(), 300);

  let backfilled = store.get("$e120").await.unwrap().unwrap();
  assert_eq!(backfilled.origin, EventOrigin::Backfill);
  let newest = store.query(&EventFilter::Source("!r:x".into()), 1).await.unwrap();
  assert_eq!(newest[0].identity, "$e299");
}

#[tokio::test]
async fn test_resync_clears_token_and_cursors_only() {
  let dir = common::store_dir();
  let store: Arc<dyn EventStore> = Arc::new(LanceEventStore::open(&dir.path().join("lancedb")).await.unwrap());
  let ingest = IngestCoordinator::new(writer(store.clone()));

  ingest
    .process_batch(
      &common::sync_batch("s1", "!r:x", vec![common::message("$A", 1_000)]),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
  store.save_stream_token("s1").await.unwrap();

  store.reset_stream_state().await.unwrap();

  assert_eq!(store.stream_token().await.unwrap(), None);
  assert!(store.latest_cursor("!r:x").await.unwrap().is_none());
  assert_eq!(store.count().await.unwrap(), 1);
}
