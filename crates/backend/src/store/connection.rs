use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use lancedb::{
  Connection, connect,
  index::{
    Index,
    scalar::{BTreeIndexBuilder, FtsIndexBuilder},
  },
  table::OptimizeAction,
};
use mxindex_core::{Cursor, Event, EventFilter, Frontier, Gap};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
  EventStore, Result, StoreError, StoreStats, UpsertOutcome,
  lock::StoreLock,
  schema::{
    CURSORS_TABLE, EVENTS_TABLE, FRONTIERS_TABLE, GAPS_TABLE, SYNC_STATE_TABLE, cursors_schema, events_schema,
    frontiers_schema, gaps_schema, sync_state_schema,
  },
};

/// Scalar columns that get a BTree index
const SCALAR_INDEX_COLUMNS: &[&str] = &["identity", "source_id", "sender", "server_timestamp", "kind"];

/// Column carrying the full-text index
pub(super) const FTS_COLUMN: &str = "body";

const DEFAULT_OPTIMIZE_EVERY: usize = 1_000;

const REQUIRED_TABLES: &[&str] = &[EVENTS_TABLE, CURSORS_TABLE, FRONTIERS_TABLE, GAPS_TABLE, SYNC_STATE_TABLE];

/// LanceDB-backed event store
pub struct LanceEventStore {
  pub path: PathBuf,
  pub connection: Connection,
  /// Serializes event writes so the existence check and insert are atomic
  pub(super) writer: Mutex<()>,
  pub(super) has_fts: AtomicBool,
  /// Inserts since the events table was last optimized
  pub(super) pending_inserts: AtomicUsize,
  optimize_every: usize,
  lock: Option<StoreLock>,
}

impl LanceEventStore {
  /// Open as the only writer. Fails with `StoreError::Locked` while another
  /// process holds the store.
  pub async fn open_exclusive(db_path: &Path) -> Result<Self> {
    let lock = StoreLock::acquire(db_path)?;
    let mut store = Self::open(db_path).await?;
    store.lock = Some(lock);
    Ok(store)
  }

  /// Open or create the store at `db_path` without taking the writer lock
  pub async fn open(db_path: &Path) -> Result<Self> {
    if let Some(parent) = db_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let store = Self::connect_at(db_path).await?;
    debug!("Initializing database schema");
    store.ensure_tables().await?;
    store.refresh_index_state().await;

    Ok(store)
  }

  /// Open an existing store for queries. Creates nothing: a missing
  /// directory or table is `StoreError::NotFound`.
  pub async fn open_read_only(db_path: &Path) -> Result<Self> {
    if !tokio::fs::try_exists(db_path).await? {
      return Err(StoreError::NotFound(db_path.to_path_buf()));
    }

    let store = Self::connect_at(db_path).await?;
    let table_names = store.connection.table_names().execute().await?;
    if !REQUIRED_TABLES.iter().all(|name| table_names.iter().any(|t| t == name)) {
      warn!(path = %db_path.display(), tables = table_names.len(), "Store is missing tables");
      return Err(StoreError::NotFound(db_path.to_path_buf()));
    }
    store.refresh_index_state().await;

    Ok(store)
  }

  async fn connect_at(db_path: &Path) -> Result<Self> {
    info!(path = %db_path.display(), "Opening event store");
    let connection = match connect(db_path.to_string_lossy().as_ref()).execute().await {
      Ok(conn) => {
        debug!(path = %db_path.display(), "Database connection established");
        conn
      }
      Err(e) => {
        error!(path = %db_path.display(), err = %e, "Failed to connect to database");
        return Err(e.into());
      }
    };

    Ok(Self {
      path: db_path.to_path_buf(),
      connection,
      writer: Mutex::new(()),
      has_fts: AtomicBool::new(false),
      pending_inserts: AtomicUsize::new(0),
      optimize_every: DEFAULT_OPTIMIZE_EVERY,
      lock: None,
    })
  }

  /// Optimize after every `n` inserts; 0 turns it off
  pub fn with_optimize_every(mut self, n: usize) -> Self {
    self.optimize_every = n;
    self
  }

  pub fn is_exclusive(&self) -> bool {
    self.lock.is_some()
  }

  /// Compact small fragments, prune old versions and fold new rows into
  /// the indexes
  pub async fn optimize(&self) -> Result<()> {
    let table = self.events_table().await?;
    table.optimize(OptimizeAction::All).await?;
    self.pending_inserts.store(0, Ordering::Relaxed);
    debug!(table = EVENTS_TABLE, "Table optimized");
    Ok(())
  }

  /// Count one insert and optimize once enough have piled up.
  /// Called with the writer lock held.
  pub(super) async fn note_insert(&self, table: &lancedb::Table) {
    if self.optimize_every == 0 {
      return;
    }
    let pending = self.pending_inserts.fetch_add(1, Ordering::Relaxed) + 1;
    if pending < self.optimize_every {
      return;
    }

    self.pending_inserts.store(0, Ordering::Relaxed);
    match table.optimize(OptimizeAction::All).await {
      Ok(_) => debug!(inserts = pending, "Events table optimized"),
      Err(e) => warn!(err = %e, "Events table optimize failed"),
    }
  }

  /// Ensure all required tables exist
  async fn ensure_tables(&self) -> Result<()> {
    let table_names = self.connection.table_names().execute().await?;
    debug!(existing_tables = table_names.len(), "Checking required tables");

    let required = [
      (EVENTS_TABLE, events_schema()),
      (CURSORS_TABLE, cursors_schema()),
      (FRONTIERS_TABLE, frontiers_schema()),
      (GAPS_TABLE, gaps_schema()),
      (SYNC_STATE_TABLE, sync_state_schema()),
    ];

    for (name, schema) in required {
      if !table_names.iter().any(|t| t == name) {
        debug!(table = name, "Creating table");
        self.connection.create_empty_table(name, schema).execute().await?;
      }
    }

    Ok(())
  }

  /// Create the scalar and full-text indexes on the events table.
  ///
  /// Index maintenance is best effort: a failure is logged and queries keep
  /// working through plain scans. Returns the number of indexes created.
  pub async fn ensure_indexes(&self) -> usize {
    let table = match self.events_table().await {
      Ok(t) => t,
      Err(e) => {
        warn!(err = %e, "Cannot open events table for indexing");
        return 0;
      }
    };

    let existing: Vec<String> = match table.list_indices().await {
      Ok(indices) => indices.into_iter().flat_map(|i| i.columns).collect(),
      Err(e) => {
        warn!(err = %e, "Failed to list indexes");
        Vec::new()
      }
    };

    let mut created = 0;
    for column in SCALAR_INDEX_COLUMNS {
      if existing.iter().any(|c| c == column) {
        continue;
      }
      match table
        .create_index(&[*column], Index::BTree(BTreeIndexBuilder::default()))
        .execute()
        .await
      {
        Ok(()) => {
          debug!(column = column, "Created scalar index");
          created += 1;
        }
        Err(e) => warn!(column = column, err = %e, "Failed to create scalar index"),
      }
    }

    if !existing.iter().any(|c| c == FTS_COLUMN) {
      match table
        .create_index(&[FTS_COLUMN], Index::FTS(FtsIndexBuilder::default()))
        .execute()
        .await
      {
        Ok(()) => {
          debug!(column = FTS_COLUMN, "Created full-text index");
          created += 1;
        }
        Err(e) => warn!(column = FTS_COLUMN, err = %e, "Failed to create full-text index"),
      }
    }

    self.refresh_index_state().await;
    info!(created, "Index maintenance complete");
    created
  }

  async fn refresh_index_state(&self) {
    let Ok(table) = self.events_table().await else {
      return;
    };
    if let Ok(indices) = table.list_indices().await {
      let has_fts = indices.iter().any(|i| i.columns.iter().any(|c| c == FTS_COLUMN));
      self.has_fts.store(has_fts, Ordering::Relaxed);
    }
  }

  pub async fn events_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(EVENTS_TABLE).execute().await?)
  }

  pub async fn cursors_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(CURSORS_TABLE).execute().await?)
  }

  pub async fn frontiers_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(FRONTIERS_TABLE).execute().await?)
  }

  pub async fn gaps_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(GAPS_TABLE).execute().await?)
  }

  pub async fn sync_state_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table(SYNC_STATE_TABLE).execute().await?)
  }
}

/// Quote a string literal for a Lance SQL filter
pub(super) fn quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl EventStore for LanceEventStore {
  async fn upsert(&self, event: &Event) -> Result<UpsertOutcome> {
    self.upsert_event(event).await
  }

  async fn get(&self, identity: &str) -> Result<Option<Event>> {
    self.get_event(identity).await
  }

  async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<Event>> {
    self.query_events(filter, limit).await
  }

  async fn count(&self) -> Result<usize> {
    self.count_events().await
  }

  async fn stats(&self) -> Result<StoreStats> {
    self.compute_stats().await
  }

  async fn latest_cursor(&self, source_id: &str) -> Result<Option<Cursor>> {
    self.get_cursor(source_id).await
  }

  async fn save_cursor(&self, cursor: &Cursor) -> Result<()> {
    self.put_cursor(cursor).await
  }

  async fn earliest_known(&self, source_id: &str) -> Result<Option<(i64, String)>> {
    self.earliest_event(source_id).await
  }

  async fn frontier(&self, source_id: &str) -> Result<Option<Frontier>> {
    self.get_frontier(source_id).await
  }

  async fn save_frontier(&self, frontier: &Frontier) -> Result<()> {
    self.put_frontier(frontier).await
  }

  async fn gap(&self, source_id: &str, token: &str) -> Result<Option<Gap>> {
    self.get_gap(source_id, token).await
  }

  async fn add_gap(&self, gap: &Gap) -> Result<()> {
    self.put_gap(gap, false).await
  }

  async fn save_gap(&self, gap: &Gap) -> Result<()> {
    self.put_gap(gap, true).await
  }

  async fn remove_gap(&self, source_id: &str, token: &str) -> Result<()> {
    self.delete_gap(source_id, token).await
  }

  async fn pending_gaps(&self) -> Result<Vec<Gap>> {
    self.list_gaps().await
  }

  async fn stream_token(&self) -> Result<Option<String>> {
    self.get_stream_token().await
  }

  async fn save_stream_token(&self, token: &str) -> Result<()> {
    self.put_stream_token(token).await
  }

  async fn reset_stream_state(&self) -> Result<()> {
    self.clear_stream_state().await
  }
}
