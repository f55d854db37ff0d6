//! Matrix client-server protocol boundary.
//!
//! The coordinators only see [`MessageSource`]: a sync long-poll keyed by an
//! opaque continuation token, a backwards history walk per room, and the
//! joined room list. [`MatrixClient`] implements it over HTTP.

mod client;

use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backoff::{BackoffPolicy, sleep_or_cancel};

pub use client::MatrixClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
  /// Credentials rejected. Never retried.
  #[error("Authentication failed: {0}")]
  Auth(String),
  /// The server refused this particular request (e.g. no access to a room)
  #[error("Request rejected: {0}")]
  Rejected(String),
  #[error("Network error: {0}")]
  Network(String),
  #[error("Request timed out")]
  Timeout,
  #[error("Server returned {status}: {message}")]
  Server { status: u16, message: String },
  #[error("Protocol error: {0}")]
  Protocol(String),
}

impl SourceError {
  /// Worth retrying after a backoff
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      SourceError::Network(_) | SourceError::Timeout | SourceError::Server { .. } | SourceError::Protocol(_)
    )
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, SourceError::Auth(_))
  }
}

/// Timeline slice for one room in a sync response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
  pub source_id: String,
  /// Raw events in server order (oldest first)
  pub events: Vec<Value>,
  /// Token to paginate backwards from the start of this slice
  pub prev_batch: Option<String>,
  /// The server dropped events between the previous sync and this slice
  pub limited: bool,
}

impl SourceBatch {
  /// A limited timeline with a pagination token leaves a hole behind it
  pub fn gap_token(&self) -> Option<&str> {
    if self.limited { self.prev_batch.as_deref() } else { None }
  }
}

/// One sync response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
  pub next_token: String,
  pub sources: Vec<SourceBatch>,
}

impl SyncBatch {
  pub fn event_count(&self) -> usize {
    self.sources.iter().map(|s| s.events.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.event_count() == 0
  }
}

/// One page of a backwards history walk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
  /// Raw events, newest first
  pub events: Vec<Value>,
  /// Token to request the next (older) page
  pub next_before_token: Option<String>,
  pub has_more: bool,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
  /// Long-poll for events after `since`. Returns an empty batch when
  /// `timeout` elapses with nothing new.
  async fn next_batch(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch, SourceError>;

  /// Page backwards through a room's history from `before`. `None` starts at
  /// the live end of the room.
  async fn history(&self, source_id: &str, before: Option<&str>, limit: usize) -> Result<HistoryPage, SourceError>;

  async fn joined_sources(&self) -> Result<Vec<String>, SourceError>;
}

/// Run `op` until it succeeds, backing off after transient failures.
///
/// Returns `Ok(None)` if shutdown was requested first. Auth and rejected
/// requests are returned as errors without retrying.
pub async fn retry_transient<T, F, Fut>(
  policy: &dyn BackoffPolicy,
  cancel: &CancellationToken,
  what: &'static str,
  mut op: F,
) -> Result<Option<T>, SourceError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, SourceError>>,
{
  let mut attempt = 0u32;
  loop {
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Ok(None),
      result = op() => result,
    };

    match result {
      Ok(value) => return Ok(Some(value)),
      Err(e) if e.is_transient() => {
        let delay = policy.delay(attempt);
        warn!(
          operation = what,
          attempt = attempt + 1,
          backoff_ms = delay.as_millis() as u64,
          err = %e,
          "Homeserver unavailable, retrying"
        );
        if !sleep_or_cancel(delay, cancel).await {
          return Ok(None);
        }
        attempt = attempt.saturating_add(1);
      }
      Err(e) => return Err(e),
    }
  }
}

// ============================================================================
// Wire formats
// ============================================================================

#[derive(Debug, Deserialize)]
struct SyncResponse {
  next_batch: String,
  #[serde(default)]
  rooms: Rooms,
}

#[derive(Debug, Default, Deserialize)]
struct Rooms {
  #[serde(default)]
  join: BTreeMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
  #[serde(default)]
  timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
  #[serde(default)]
  events: Vec<Value>,
  #[serde(default)]
  limited: bool,
  prev_batch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
  #[serde(default)]
  chunk: Vec<Value>,
  end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
  joined_rooms: Vec<String>,
}

/// Decode a `/sync` response body
pub fn parse_sync(body: Value) -> Result<SyncBatch, SourceError> {
  let response: SyncResponse =
    serde_json::from_value(body).map_err(|e| SourceError::Protocol(format!("sync response: {}", e)))?;

  let sources = response
    .rooms
    .join
    .into_iter()
    .map(|(source_id, room)| SourceBatch {
      source_id,
      events: room.timeline.events,
      prev_batch: room.timeline.prev_batch,
      limited: room.timeline.limited,
    })
    .collect();

  Ok(SyncBatch {
    next_token: response.next_batch,
    sources,
  })
}

/// Decode a `/rooms/{id}/messages` response body.
///
/// History is exhausted when the server omits `end` or returns an empty chunk.
pub fn parse_messages(body: Value) -> Result<HistoryPage, SourceError> {
  let response: MessagesResponse =
    serde_json::from_value(body).map_err(|e| SourceError::Protocol(format!("messages response: {}", e)))?;

  let has_more = response.end.is_some() && !response.chunk.is_empty();
  Ok(HistoryPage {
    events: response.chunk,
    next_before_token: if has_more { response.end } else { None },
    has_more,
  })
}

pub fn parse_joined_rooms(body: Value) -> Result<Vec<String>, SourceError> {
  let response: JoinedRoomsResponse =
    serde_json::from_value(body).map_err(|e| SourceError::Protocol(format!("joined_rooms response: {}", e)))?;
  Ok(response.joined_rooms)
}
