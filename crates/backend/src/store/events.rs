// Events table operations

use std::{
  cmp::{self, Reverse},
  collections::BinaryHeap,
  sync::Arc,
  sync::atomic::Ordering,
  time::Instant,
};

use arrow_array::{Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use lancedb::{
  index::scalar::FullTextSearchQuery,
  query::{ExecutableQuery, QueryBase, Select},
};
use mxindex_core::{Event, EventFilter, EventOrigin};
use tracing::{debug, trace, warn};

use super::{
  Result, StoreError, UpsertOutcome,
  connection::{LanceEventStore, quote},
  schema::{Row, datetime_from_millis, events_schema},
};

/// Upper bound on candidates pulled from the full-text index before recency ordering
const FTS_CANDIDATES: usize = 10_000;

impl LanceEventStore {
  /// Insert an event unless its identity is already stored.
  ///
  /// The writer lock makes the existence check and the insert one step, so
  /// concurrent callers for the same identity see exactly one `Inserted`.
  #[tracing::instrument(level = "trace", skip(self, event), fields(identity = %event.identity))]
  pub async fn upsert_event(&self, event: &Event) -> Result<UpsertOutcome> {
    let _guard = self.writer.lock().await;
    // Opened under the lock so the existence check sees the latest version
    let table = self.events_table().await?;

    let existing = table
      .count_rows(Some(format!("identity = {}", quote(&event.identity))))
      .await?;
    if existing > 0 {
      trace!(table = "events", operation = "upsert", identity = %event.identity, "Already present");
      return Ok(UpsertOutcome::AlreadyPresent);
    }

    let batch = event_to_batch(event)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], events_schema());

    let mut merge_insert = table.merge_insert(&["identity"]);
    merge_insert.when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;
    self.note_insert(&table).await;

    trace!(
      table = "events",
      operation = "upsert",
      identity = %event.identity,
      source_id = %event.source_id,
      origin = event.origin.as_str(),
      "Inserted"
    );
    Ok(UpsertOutcome::Inserted)
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_event(&self, identity: &str) -> Result<Option<Event>> {
    let table = self.events_table().await?;

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("identity = {}", quote(identity)))
      .limit(1)
      .execute()
      .await?
      .try_collect()
      .await?;

    match results.iter().find(|b| b.num_rows() > 0) {
      Some(batch) => Ok(Some(batch_to_event(batch, 0)?)),
      None => Ok(None),
    }
  }

  /// Filtered query, newest first
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn query_events(&self, filter: &EventFilter, limit: usize) -> Result<Vec<Event>> {
    let start = Instant::now();
    if limit == 0 {
      return Ok(Vec::new());
    }

    let events = match filter {
      EventFilter::Text(text) if self.has_fts.load(Ordering::Relaxed) => match self.search_text(text, limit).await {
        Ok(events) => events,
        Err(e) => {
          warn!(err = %e, "Full-text search failed, falling back to scan");
          self.scan_newest(Some(filter_sql(filter)), limit).await?
        }
      },
      EventFilter::All => self.scan_newest(None, limit).await?,
      other => self.scan_newest(Some(filter_sql(other)), limit).await?,
    };

    trace!(
      table = "events",
      operation = "query",
      results = events.len(),
      elapsed_ms = start.elapsed().as_millis() as u64,
      "Query complete"
    );
    Ok(events)
  }

  /// Stream matching rows, keeping only the newest `limit`
  async fn scan_newest(&self, filter: Option<String>, limit: usize) -> Result<Vec<Event>> {
    let table = self.events_table().await?;
    let query = match filter {
      Some(f) => table.query().only_if(f),
      None => table.query(),
    };

    let mut newest = Newest::new(limit);
    let mut batches = query.execute().await?;
    while let Some(batch) = batches.try_next().await? {
      newest.offer_batch(&batch)?;
    }
    Ok(newest.into_events())
  }

  async fn search_text(&self, text: &str, limit: usize) -> Result<Vec<Event>> {
    let table = self.events_table().await?;
    let mut batches = table
      .query()
      .full_text_search(FullTextSearchQuery::new(text.to_string()))
      .limit(FTS_CANDIDATES)
      .execute()
      .await?;

    let mut newest = Newest::new(limit);
    let mut seen = 0;
    while let Some(batch) = batches.try_next().await? {
      seen += batch.num_rows();
      newest.offer_batch(&batch)?;
    }
    debug!(query = text, candidates = seen, "Full-text search");
    Ok(newest.into_events())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn count_events(&self) -> Result<usize> {
    let table = self.events_table().await?;
    Ok(table.count_rows(None).await?)
  }

  /// Oldest stored event for a source
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn earliest_event(&self, source_id: &str) -> Result<Option<(i64, String)>> {
    let table = self.events_table().await?;

    let mut batches = table
      .query()
      .only_if(format!("source_id = {}", quote(source_id)))
      .select(Select::columns(&["identity", "server_timestamp"]))
      .execute()
      .await?;

    let mut earliest: Option<(i64, String)> = None;
    while let Some(batch) = batches.try_next().await? {
      for i in 0..batch.num_rows() {
        let row = Row::new(&batch, i);
        let ts = row.i64("server_timestamp")?;
        if earliest.as_ref().is_none_or(|(oldest, _)| ts < *oldest) {
          earliest = Some((ts, row.string("identity")?));
        }
      }
    }

    Ok(earliest)
  }
}

/// Lance SQL predicate for a non-text-index query
fn filter_sql(filter: &EventFilter) -> String {
  match filter {
    EventFilter::All => "true".to_string(),
    EventFilter::Source(id) => format!("source_id = {}", quote(id)),
    EventFilter::Sender(id) => format!("sender = {}", quote(id)),
    EventFilter::Kind(kind) => format!("kind = {}", quote(kind)),
    EventFilter::Text(text) => {
      let terms: Vec<String> = text
        .split_whitespace()
        .map(|term| format!("lower(body) LIKE {}", quote(&format!("%{}%", term.to_lowercase()))))
        .collect();
      if terms.is_empty() {
        "false".to_string()
      } else {
        format!("({})", terms.join(" OR "))
      }
    }
    EventFilter::TimeRange { start_ms, end_ms } => {
      format!("server_timestamp >= {} AND server_timestamp <= {}", start_ms, end_ms)
    }
  }
}

/// Recency rank: newer first, then identity ascending
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Rank(i64, Reverse<String>);

struct Ranked {
  rank: Rank,
  event: Event,
}

impl PartialEq for Ranked {
  fn eq(&self, other: &Self) -> bool {
    self.rank == other.rank
  }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Ranked {
  fn cmp(&self, other: &Self) -> cmp::Ordering {
    self.rank.cmp(&other.rank)
  }
}

/// Bounded top-k over streamed batches. Rows that cannot make the cut are
/// never decoded.
struct Newest {
  limit: usize,
  // Min-heap: the weakest kept event is on top
  kept: BinaryHeap<Reverse<Ranked>>,
}

impl Newest {
  fn new(limit: usize) -> Self {
    Self {
      limit,
      kept: BinaryHeap::with_capacity(limit.min(1_024)),
    }
  }

  fn admits(&self, rank: &Rank) -> bool {
    if self.kept.len() < self.limit {
      return true;
    }
    self.kept.peek().is_some_and(|Reverse(weakest)| *rank > weakest.rank)
  }

  fn offer_batch(&mut self, batch: &RecordBatch) -> Result<()> {
    for i in 0..batch.num_rows() {
      let row = Row::new(batch, i);
      let rank = Rank(row.i64("server_timestamp")?, Reverse(row.string("identity")?));
      if !self.admits(&rank) {
        continue;
      }
      if self.kept.len() >= self.limit {
        self.kept.pop();
      }
      let event = batch_to_event(batch, i)?;
      self.kept.push(Reverse(Ranked { rank, event }));
    }
    Ok(())
  }

  fn into_events(self) -> Vec<Event> {
    self
      .kept
      .into_sorted_vec()
      .into_iter()
      .map(|Reverse(ranked)| ranked.event)
      .collect()
  }
}

/// Convert an Event to an Arrow RecordBatch
fn event_to_batch(event: &Event) -> Result<RecordBatch> {
  let identity = StringArray::from(vec![event.identity.clone()]);
  let source_id = StringArray::from(vec![event.source_id.clone()]);
  let sender = StringArray::from(vec![event.sender.clone()]);
  let kind = StringArray::from(vec![event.kind.clone()]);
  let server_timestamp = Int64Array::from(vec![event.server_timestamp]);
  let ingest_timestamp = Int64Array::from(vec![event.ingest_timestamp.timestamp_millis()]);
  let origin = StringArray::from(vec![event.origin.as_str()]);
  let body = StringArray::from(vec![event.body().map(str::to_string)]);
  let payload = StringArray::from(vec![serde_json::to_string(&event.payload)?]);
  let raw = StringArray::from(vec![serde_json::to_string(&event.raw)?]);

  let batch = RecordBatch::try_new(
    events_schema(),
    vec![
      Arc::new(identity),
      Arc::new(source_id),
      Arc::new(sender),
      Arc::new(kind),
      Arc::new(server_timestamp),
      Arc::new(ingest_timestamp),
      Arc::new(origin),
      Arc::new(body),
      Arc::new(payload),
      Arc::new(raw),
    ],
  )?;

  Ok(batch)
}

/// Convert a RecordBatch row to an Event
fn batch_to_event(batch: &RecordBatch, row: usize) -> Result<Event> {
  let row = Row::new(batch, row);

  let origin = row
    .string("origin")?
    .parse::<EventOrigin>()
    .map_err(StoreError::Corrupt)?;

  Ok(Event {
    identity: row.string("identity")?,
    source_id: row.string("source_id")?,
    sender: row.string("sender")?,
    kind: row.string("kind")?,
    server_timestamp: row.i64("server_timestamp")?,
    ingest_timestamp: datetime_from_millis(row.i64("ingest_timestamp")?),
    payload: serde_json::from_str(&row.string("payload")?)?,
    raw: serde_json::from_str(&row.string("raw")?)?,
    origin,
  })
}
