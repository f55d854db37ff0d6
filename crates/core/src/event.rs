//! Event data model shared by the ingestion core, the store, and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event type of plain room messages (the only kind with a searchable body)
pub const MESSAGE_KIND: &str = "m.room.message";

/// Maximum characters kept in a cached body preview
pub const PREVIEW_CHARS: usize = 80;

/// Which path wrote an event into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
  #[default]
  Live,
  Backfill,
}

impl EventOrigin {
  pub fn as_str(&self) -> &'static str {
    match self {
      EventOrigin::Live => "live",
      EventOrigin::Backfill => "backfill",
    }
  }
}

impl std::str::FromStr for EventOrigin {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "live" => Ok(EventOrigin::Live),
      "backfill" => Ok(EventOrigin::Backfill),
      other => Err(format!("unknown event origin: {}", other)),
    }
  }
}

/// Why an inbound event was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
  #[error("event is not a JSON object")]
  NotAnObject,
  #[error("missing required field `{0}`")]
  MissingField(&'static str),
}

/// A single stored event.
///
/// `identity` is the natural key; every write is an upsert on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub identity: String,
  pub source_id: String,
  pub sender: String,
  pub kind: String,
  /// Origin server timestamp in milliseconds
  pub server_timestamp: i64,
  pub ingest_timestamp: DateTime<Utc>,
  pub payload: Value,
  pub raw: Value,
  pub origin: EventOrigin,
}

fn non_empty_str<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
  raw.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl Event {
  /// Parse and validate a raw protocol event.
  ///
  /// `source_id` comes from the enclosing batch; when empty, the event's own
  /// `room_id` is used instead. Identity, kind and source are required.
  pub fn from_raw(source_id: &str, raw: Value, origin: EventOrigin) -> Result<Self, MalformedEvent> {
    if !raw.is_object() {
      return Err(MalformedEvent::NotAnObject);
    }

    let identity = non_empty_str(&raw, "event_id")
      .ok_or(MalformedEvent::MissingField("event_id"))?
      .to_string();
    let kind = non_empty_str(&raw, "type")
      .ok_or(MalformedEvent::MissingField("type"))?
      .to_string();
    let source_id = if source_id.is_empty() {
      non_empty_str(&raw, "room_id")
        .ok_or(MalformedEvent::MissingField("room_id"))?
        .to_string()
    } else {
      source_id.to_string()
    };

    let sender = non_empty_str(&raw, "sender").unwrap_or_default().to_string();
    let server_timestamp = raw.get("origin_server_ts").and_then(Value::as_i64).unwrap_or(0);
    let payload = raw
      .get("content")
      .filter(|c| c.is_object())
      .cloned()
      .unwrap_or_else(|| Value::Object(Default::default()));

    Ok(Self {
      identity,
      source_id,
      sender,
      kind,
      server_timestamp,
      ingest_timestamp: Utc::now(),
      payload,
      raw,
      origin,
    })
  }

  /// Message body, the full-text searchable field
  pub fn body(&self) -> Option<&str> {
    self.payload.get("body").and_then(Value::as_str)
  }

  /// Origin server time as a UTC datetime
  pub fn server_time(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(self.server_timestamp)
  }

  pub fn is_message(&self) -> bool {
    self.kind == MESSAGE_KIND
  }

  /// Cache projection of this event
  pub fn summary(&self) -> EventSummary {
    EventSummary {
      source_id: self.source_id.clone(),
      sender: self.sender.clone(),
      kind: self.kind.clone(),
      server_timestamp: self.server_timestamp,
      preview: self.body().map(|b| b.chars().take(PREVIEW_CHARS).collect()),
    }
  }
}

/// Compact projection of an event kept by the recency cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
  pub source_id: String,
  pub sender: String,
  pub kind: String,
  pub server_timestamp: i64,
  pub preview: Option<String>,
}

// ============================================================================
// Cursor
// ============================================================================

/// Per-source bookmark for real-time resumption.
///
/// `last_timestamp` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
  pub source_id: String,
  /// Stream continuation token of the batch that delivered the last write
  pub token: Option<String>,
  pub last_event_id: String,
  pub last_timestamp: i64,
  pub updated_at: DateTime<Utc>,
}

impl Cursor {
  pub fn new(token: Option<&str>, event: &Event) -> Self {
    Self {
      source_id: event.source_id.clone(),
      token: token.map(str::to_string),
      last_event_id: event.identity.clone(),
      last_timestamp: event.server_timestamp,
      updated_at: Utc::now(),
    }
  }

  /// Move the cursor forward to `event`. Older events refresh the token but
  /// leave the timestamp where it is. Returns true if anything changed.
  pub fn advance(&mut self, token: Option<&str>, event: &Event) -> bool {
    let mut changed = false;

    if event.server_timestamp >= self.last_timestamp && event.identity != self.last_event_id {
      self.last_event_id = event.identity.clone();
      self.last_timestamp = event.server_timestamp;
      changed = true;
    }

    if let Some(token) = token
      && self.token.as_deref() != Some(token)
    {
      self.token = Some(token.to_string());
      changed = true;
    }

    if changed {
      self.updated_at = Utc::now();
    }
    changed
  }

  /// True if `event` is newer than what the cursor has recorded
  pub fn lags(&self, event: &Event) -> bool {
    event.server_timestamp > self.last_timestamp
  }
}

// ============================================================================
// Frontier
// ============================================================================

/// Per-source bookmark for backfill, moving backward through history.
///
/// `oldest_timestamp` only ever decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
  pub source_id: String,
  /// Pagination token to continue the backwards walk from
  pub before_token: Option<String>,
  pub oldest_timestamp: Option<i64>,
  pub oldest_event_id: Option<String>,
  /// The server reported there is no older history
  pub complete: bool,
  pub updated_at: DateTime<Utc>,
}

impl Frontier {
  pub fn new(source_id: impl Into<String>, before_token: Option<String>) -> Self {
    Self {
      source_id: source_id.into(),
      before_token,
      oldest_timestamp: None,
      oldest_event_id: None,
      complete: false,
      updated_at: Utc::now(),
    }
  }

  /// Record a stored event, moving the oldest marker backward if it is older
  pub fn retreat(&mut self, event: &Event) {
    let older = self.oldest_timestamp.is_none_or(|ts| event.server_timestamp < ts);
    if older {
      self.oldest_timestamp = Some(event.server_timestamp);
      self.oldest_event_id = Some(event.identity.clone());
      self.updated_at = Utc::now();
    }
  }

  /// Move the resume point to the boundary of a fully processed page
  pub fn checkpoint(&mut self, before_token: Option<String>) {
    self.before_token = before_token;
    self.updated_at = Utc::now();
  }

  pub fn mark_complete(&mut self) {
    self.complete = true;
    self.before_token = None;
    self.updated_at = Utc::now();
  }
}

// ============================================================================
// Gap
// ============================================================================

/// A hole behind a limited sync timeline, kept until a walk fills it.
///
/// Identified by `(source_id, token)`, the pagination token the hole was
/// reported at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
  pub source_id: String,
  pub token: String,
  /// Page boundary to resume from. `None` until a walk has started.
  pub before_token: Option<String>,
  pub updated_at: DateTime<Utc>,
}

impl Gap {
  pub fn new(source_id: impl Into<String>, token: impl Into<String>) -> Self {
    Self {
      source_id: source_id.into(),
      token: token.into(),
      before_token: None,
      updated_at: Utc::now(),
    }
  }

  /// True once a walk has begun on this gap
  pub fn started(&self) -> bool {
    self.before_token.is_some()
  }

  /// Where the next walk requests history from
  pub fn resume_token(&self) -> &str {
    self.before_token.as_deref().unwrap_or(&self.token)
  }

  pub fn checkpoint(&mut self, before_token: impl Into<String>) {
    self.before_token = Some(before_token.into());
    self.updated_at = Utc::now();
  }
}

// ============================================================================
// Query filter
// ============================================================================

/// Read-side filter for store queries. Results are ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
  All,
  Source(String),
  Sender(String),
  Kind(String),
  Text(String),
  /// Inclusive range over `server_timestamp` in milliseconds
  TimeRange { start_ms: i64, end_ms: i64 },
}

impl EventFilter {
  /// In-memory evaluation, used by the memory store and to post-filter results
  pub fn matches(&self, event: &Event) -> bool {
    match self {
      EventFilter::All => true,
      EventFilter::Source(id) => &event.source_id == id,
      EventFilter::Sender(id) => &event.sender == id,
      EventFilter::Kind(kind) => &event.kind == kind,
      EventFilter::Text(query) => {
        let Some(body) = event.body() else {
          return false;
        };
        let body = body.to_lowercase();
        query
          .split_whitespace()
          .any(|term| body.contains(&term.to_lowercase()))
      }
      EventFilter::TimeRange { start_ms, end_ms } => {
        event.server_timestamp >= *start_ms && event.server_timestamp <= *end_ms
      }
    }
  }
}
