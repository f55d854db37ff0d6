//! Common utilities for the pipeline integration tests

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use mxindex::matrix::{HistoryPage, MessageSource, SourceBatch, SourceError, SyncBatch};
use serde_json::{Value, json};
use tempfile::TempDir;

pub fn message(id: &str, ts: i64) -> Value {
  json!({
    "event_id": id,
    "type": "m.room.message",
    "sender": "@bob:example.org",
    "origin_server_ts": ts,
    "content": {"msgtype": "m.text", "body": format!("hello from {}", id)},
  })
}

pub fn sync_batch(token: &str, room: &str, events: Vec<Value>) -> SyncBatch {
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

/// Fresh directory for a LanceDB store
pub fn store_dir() -> TempDir {
  TempDir::new().expect("Failed to create store temp dir")
}

/// Serves room history from fixed timelines using `t<index>` tokens
#[derive(Default)]
pub struct HistorySource {
  rooms: Mutex<HashMap<String, Vec<Value>>>,
  requests: Mutex<usize>,
}

#[allow(dead_code)]
impl HistorySource {
  pub fn with_room(room: &str, timeline: Vec<Value>) -> Self {
    let source = Self::default();
    source.rooms.lock().unwrap().insert(room.to_string(), timeline);
    source
  }

  pub fn requests(&self) -> usize {
    *self.requests.lock().unwrap()
  }
}

#[async_trait]
impl MessageSource for HistorySource {
  async fn next_batch(&self, _since: Option<&str>, _timeout: Duration) -> Result<SyncBatch, SourceError> {
    Err(SourceError::Rejected("history only".into()))
  }

  async fn history(&self, source_id: &str, before: Option<&str>, limit: usize) -> Result<HistoryPage, SourceError> {
    *self.requests.lock().unwrap() += 1;
    let rooms = self.rooms.lock().unwrap();
    let timeline = rooms
      .get(source_id)
      .ok_or_else(|| SourceError::Rejected(source_id.to_string()))?;

    let end = match before {
      Some(token) => token[1..].parse::<usize>().map_err(|e| SourceError::Protocol(e.to_string()))?,
      None => timeline.len(),
    };
    let start = end.saturating_sub(limit);
    let has_more = start > 0;
    Ok(HistoryPage {
      events: timeline[start..end].iter().rev().cloned().collect(),
      next_before_token: has_more.then(|| format!("t{}", start)),
      has_more,
    })
  }

  async fn joined_sources(&self) -> Result<Vec<String>, SourceError> {
    Ok(self.rooms.lock().unwrap().keys().cloned().collect())
  }
}
