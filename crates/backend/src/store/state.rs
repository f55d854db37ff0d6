// Cursor, frontier, gap and stream token persistence

use std::sync::Arc;

use arrow_array::{BooleanArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use mxindex_core::{Cursor, Frontier, Gap};
use tracing::{debug, info, trace};

use super::{
  Result,
  connection::{LanceEventStore, quote},
  schema::{Row, cursors_schema, datetime_from_millis, frontiers_schema, gaps_schema, sync_state_schema},
};

/// sync_state key holding the stream continuation token
const STREAM_TOKEN_KEY: &str = "next_batch";

impl LanceEventStore {
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_cursor(&self, source_id: &str) -> Result<Option<Cursor>> {
    let table = self.cursors_table().await?;
    match first_row(table, format!("source_id = {}", quote(source_id))).await? {
      Some(batch) => Ok(Some(batch_to_cursor(&batch, 0)?)),
      None => Ok(None),
    }
  }

  #[tracing::instrument(level = "trace", skip(self, cursor), fields(source_id = %cursor.source_id))]
  pub async fn put_cursor(&self, cursor: &Cursor) -> Result<()> {
    trace!(
      table = "cursors",
      operation = "upsert",
      source_id = %cursor.source_id,
      last_timestamp = cursor.last_timestamp,
      "Saving cursor"
    );

    let table = self.cursors_table().await?;
    let batch = cursor_to_batch(cursor)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], cursors_schema());

    let mut merge_insert = table.merge_insert(&["source_id"]);
    merge_insert.when_matched_update_all(None).when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_frontier(&self, source_id: &str) -> Result<Option<Frontier>> {
    let table = self.frontiers_table().await?;
    match first_row(table, format!("source_id = {}", quote(source_id))).await? {
      Some(batch) => Ok(Some(batch_to_frontier(&batch, 0)?)),
      None => Ok(None),
    }
  }

  #[tracing::instrument(level = "trace", skip(self, frontier), fields(source_id = %frontier.source_id))]
  pub async fn put_frontier(&self, frontier: &Frontier) -> Result<()> {
    trace!(
      table = "frontiers",
      operation = "upsert",
      source_id = %frontier.source_id,
      complete = frontier.complete,
      "Saving frontier"
    );

    let table = self.frontiers_table().await?;
    let batch = frontier_to_batch(frontier)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], frontiers_schema());

    let mut merge_insert = table.merge_insert(&["source_id"]);
    merge_insert.when_matched_update_all(None).when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_gap(&self, source_id: &str, token: &str) -> Result<Option<Gap>> {
    let table = self.gaps_table().await?;
    match first_row(table, gap_filter(source_id, token)).await? {
      Some(batch) => Ok(Some(batch_to_gap(&batch, 0)?)),
      None => Ok(None),
    }
  }

  /// Insert the gap, or replace its checkpoint when `overwrite` is set
  #[tracing::instrument(level = "trace", skip(self, gap), fields(source_id = %gap.source_id, token = %gap.token))]
  pub async fn put_gap(&self, gap: &Gap, overwrite: bool) -> Result<()> {
    trace!(
      table = "gaps",
      operation = "upsert",
      source_id = %gap.source_id,
      token = %gap.token,
      before = ?gap.before_token,
      "Saving gap"
    );

    let table = self.gaps_table().await?;
    let batch = gap_to_batch(gap)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], gaps_schema());

    let mut merge_insert = table.merge_insert(&["source_id", "token"]);
    if overwrite {
      merge_insert.when_matched_update_all(None);
    }
    merge_insert.when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_gap(&self, source_id: &str, token: &str) -> Result<()> {
    let table = self.gaps_table().await?;
    table.delete(&gap_filter(source_id, token)).await?;
    debug!(source_id, token, "Gap filled");
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_gaps(&self) -> Result<Vec<Gap>> {
    let table = self.gaps_table().await?;
    let batches: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut gaps = Vec::new();
    for batch in &batches {
      for i in 0..batch.num_rows() {
        gaps.push(batch_to_gap(batch, i)?);
      }
    }
    gaps.sort_by_key(|g| g.updated_at);
    Ok(gaps)
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_stream_token(&self) -> Result<Option<String>> {
    let table = self.sync_state_table().await?;
    match first_row(table, format!("key = {}", quote(STREAM_TOKEN_KEY))).await? {
      Some(batch) => Ok(Some(Row::new(&batch, 0).string("value")?)),
      None => Ok(None),
    }
  }

  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn put_stream_token(&self, token: &str) -> Result<()> {
    let table = self.sync_state_table().await?;
    let batch = RecordBatch::try_new(
      sync_state_schema(),
      vec![
        Arc::new(StringArray::from(vec![STREAM_TOKEN_KEY])),
        Arc::new(StringArray::from(vec![token])),
        Arc::new(Int64Array::from(vec![Utc::now().timestamp_millis()])),
      ],
    )?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], sync_state_schema());

    let mut merge_insert = table.merge_insert(&["key"]);
    merge_insert.when_matched_update_all(None).when_not_matched_insert_all();
    merge_insert.execute(Box::new(batches)).await?;

    debug!(token = token, "Stream token persisted");
    Ok(())
  }

  /// Drop the stream token and all cursors
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn clear_stream_state(&self) -> Result<()> {
    let sync_state = self.sync_state_table().await?;
    sync_state
      .delete(&format!("key = {}", quote(STREAM_TOKEN_KEY)))
      .await?;

    let cursors = self.cursors_table().await?;
    let removed = cursors.count_rows(None).await?;
    cursors.delete("source_id IS NOT NULL").await?;

    info!(cursors = removed, "Stream state reset");
    Ok(())
  }
}

async fn first_row(table: lancedb::Table, filter: String) -> Result<Option<RecordBatch>> {
  let results: Vec<RecordBatch> = table
    .query()
    .only_if(filter)
    .limit(1)
    .execute()
    .await?
    .try_collect()
    .await?;
  Ok(results.into_iter().find(|b| b.num_rows() > 0))
}

fn cursor_to_batch(cursor: &Cursor) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    cursors_schema(),
    vec![
      Arc::new(StringArray::from(vec![cursor.source_id.clone()])),
      Arc::new(StringArray::from(vec![cursor.token.clone()])),
      Arc::new(StringArray::from(vec![cursor.last_event_id.clone()])),
      Arc::new(Int64Array::from(vec![cursor.last_timestamp])),
      Arc::new(Int64Array::from(vec![cursor.updated_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_cursor(batch: &RecordBatch, row: usize) -> Result<Cursor> {
  let row = Row::new(batch, row);
  Ok(Cursor {
    source_id: row.string("source_id")?,
    token: row.optional_string("token"),
    last_event_id: row.string("last_event_id")?,
    last_timestamp: row.i64("last_timestamp")?,
    updated_at: datetime_from_millis(row.i64("updated_at")?),
  })
}

fn gap_filter(source_id: &str, token: &str) -> String {
  format!("source_id = {} AND token = {}", quote(source_id), quote(token))
}

fn gap_to_batch(gap: &Gap) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    gaps_schema(),
    vec![
      Arc::new(StringArray::from(vec![gap.source_id.clone()])),
      Arc::new(StringArray::from(vec![gap.token.clone()])),
      Arc::new(StringArray::from(vec![gap.before_token.clone()])),
      Arc::new(Int64Array::from(vec![gap.updated_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_gap(batch: &RecordBatch, row: usize) -> Result<Gap> {
  let row = Row::new(batch, row);
  Ok(Gap {
    source_id: row.string("source_id")?,
    token: row.string("token")?,
    before_token: row.optional_string("before_token"),
    updated_at: datetime_from_millis(row.i64("updated_at")?),
  })
}

fn frontier_to_batch(frontier: &Frontier) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    frontiers_schema(),
    vec![
      Arc::new(StringArray::from(vec![frontier.source_id.clone()])),
      Arc::new(StringArray::from(vec![frontier.before_token.clone()])),
      Arc::new(Int64Array::from(vec![frontier.oldest_timestamp])),
      Arc::new(StringArray::from(vec![frontier.oldest_event_id.clone()])),
      Arc::new(BooleanArray::from(vec![frontier.complete])),
      Arc::new(Int64Array::from(vec![frontier.updated_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_frontier(batch: &RecordBatch, row: usize) -> Result<Frontier> {
  let row = Row::new(batch, row);
  Ok(Frontier {
    source_id: row.string("source_id")?,
    before_token: row.optional_string("before_token"),
    oldest_timestamp: row.optional_i64("oldest_timestamp"),
    oldest_event_id: row.optional_string("oldest_event_id"),
    complete: row.bool("complete")?,
    updated_at: datetime_from_millis(row.i64("updated_at")?),
  })
}
