use std::sync::Arc;

use arrow_array::{Array, BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};

use super::{Result, StoreError};

pub const EVENTS_TABLE: &str = "events";
pub const CURSORS_TABLE: &str = "cursors";
pub const FRONTIERS_TABLE: &str = "frontiers";
pub const SYNC_STATE_TABLE: &str = "sync_state";
pub const GAPS_TABLE: &str = "gaps";

/// Schema for the events table
pub fn events_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("identity", DataType::Utf8, false), // Matrix event_id
    Field::new("source_id", DataType::Utf8, false), // Room id
    Field::new("sender", DataType::Utf8, false),
    Field::new("kind", DataType::Utf8, false),
    Field::new("server_timestamp", DataType::Int64, false), // origin_server_ts, ms
    Field::new("ingest_timestamp", DataType::Int64, false), // Unix timestamp ms
    Field::new("origin", DataType::Utf8, false),            // live, backfill
    Field::new("body", DataType::Utf8, true),               // content.body, full-text field
    Field::new("payload", DataType::Utf8, false),           // JSON object
    Field::new("raw", DataType::Utf8, false),               // JSON object
  ]))
}

/// Schema for per-source real-time cursors
pub fn cursors_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("source_id", DataType::Utf8, false),
    Field::new("token", DataType::Utf8, true),
    Field::new("last_event_id", DataType::Utf8, false),
    Field::new("last_timestamp", DataType::Int64, false),
    Field::new("updated_at", DataType::Int64, false),
  ]))
}

/// Schema for per-source backfill frontiers
pub fn frontiers_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("source_id", DataType::Utf8, false),
    Field::new("before_token", DataType::Utf8, true),
    Field::new("oldest_timestamp", DataType::Int64, true),
    Field::new("oldest_event_id", DataType::Utf8, true),
    Field::new("complete", DataType::Boolean, false),
    Field::new("updated_at", DataType::Int64, false),
  ]))
}

/// Schema for timeline gaps awaiting backfill
pub fn gaps_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("source_id", DataType::Utf8, false),
    Field::new("token", DataType::Utf8, false), // prev_batch the hole was reported at
    Field::new("before_token", DataType::Utf8, true),
    Field::new("updated_at", DataType::Int64, false),
  ]))
}

/// Key/value table for stream-level state (the sync continuation token)
pub fn sync_state_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("key", DataType::Utf8, false),
    Field::new("value", DataType::Utf8, false),
    Field::new("updated_at", DataType::Int64, false),
  ]))
}

// ============================================================================
// Row access
// ============================================================================

/// Typed accessor for one row of a RecordBatch
pub(super) struct Row<'a> {
  batch: &'a RecordBatch,
  row: usize,
}

impl<'a> Row<'a> {
  pub fn new(batch: &'a RecordBatch, row: usize) -> Self {
    Self { batch, row }
  }

  fn column<T: 'static>(&self, name: &str) -> Option<&'a T> {
    self
      .batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<T>())
  }

  pub fn string(&self, name: &str) -> Result<String> {
    self
      .column::<StringArray>(name)
      .map(|a| a.value(self.row).to_string())
      .ok_or_else(|| StoreError::Corrupt(format!("column {}", name)))
  }

  pub fn optional_string(&self, name: &str) -> Option<String> {
    self
      .column::<StringArray>(name)
      .and_then(|a| if a.is_null(self.row) { None } else { Some(a.value(self.row).to_string()) })
  }

  pub fn i64(&self, name: &str) -> Result<i64> {
    self
      .column::<Int64Array>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Corrupt(format!("column {}", name)))
  }

  pub fn optional_i64(&self, name: &str) -> Option<i64> {
    self
      .column::<Int64Array>(name)
      .and_then(|a| if a.is_null(self.row) { None } else { Some(a.value(self.row)) })
  }

  pub fn bool(&self, name: &str) -> Result<bool> {
    self
      .column::<BooleanArray>(name)
      .map(|a| a.value(self.row))
      .ok_or_else(|| StoreError::Corrupt(format!("column {}", name)))
  }
}

/// Millisecond timestamp to UTC, falling back to the epoch for out-of-range values
pub(super) fn datetime_from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
  chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
