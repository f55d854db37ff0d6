//! Historical backfill.
//!
//! A walk pages backwards through one room's history and writes every event
//! through the same [`EventWriter`] as live ingestion, tagged
//! [`EventOrigin::Backfill`]. Frontier walks resume from the room's stored
//! [`Frontier`] and checkpoint it after every fully processed page; gap walks
//! fill the hole behind a limited sync timeline and leave the frontier alone.
//!
//! Gaps are persisted by ingestion before the sync batch that reported them
//! is acknowledged. A gap walk checkpoints the gap after every page and
//! removes it once the hole is filled.
//!
//! A walk stops when the server has no older history, when its event or time
//! budget is spent (checked at page boundaries), or at the first identity that
//! is already stored. A resumed walk re-requests the page it was interrupted
//! in, so duplicates on that first page are expected and skipped.

mod pacing;
mod scheduler;

use std::{sync::Arc, time::Duration};

use mxindex_core::{BackfillConfig, Event, EventOrigin, Frontier, Gap};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use pacing::Pacer;
pub use scheduler::BackfillScheduler;

use crate::{
  backoff::{Cancelled, retry_until_cancelled, sleep_or_cancel},
  matrix::{HistoryPage, MessageSource, SourceError, retry_transient},
  writer::{EventWriter, WriteOutcome},
};

/// Work handed to the scheduler by live ingestion or the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillRequest {
  /// A room seen for the first time, with the token behind its first timeline
  Source {
    source_id: String,
    prev_batch: Option<String>,
  },
  /// A limited timeline left a hole behind `token`
  Gap { source_id: String, token: String },
}

impl BackfillRequest {
  pub fn source_id(&self) -> &str {
    match self {
      BackfillRequest::Source { source_id, .. } | BackfillRequest::Gap { source_id, .. } => source_id,
    }
  }

  pub fn into_walk(self) -> (String, WalkStart) {
    match self {
      BackfillRequest::Source { source_id, prev_batch } => (source_id, WalkStart::Frontier { seed: prev_batch }),
      BackfillRequest::Gap { source_id, token } => (source_id, WalkStart::Gap { token }),
    }
  }
}

/// Where a walk begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStart {
  /// Resume from the stored frontier. `seed` is only used when the room has
  /// no frontier yet; `None` starts at the live end of the room.
  Frontier { seed: Option<String> },
  Gap { token: String },
}

impl WalkStart {
  /// Two starts that would walk the same history
  pub fn same_walk(&self, other: &WalkStart) -> bool {
    match (self, other) {
      (WalkStart::Frontier { .. }, WalkStart::Frontier { .. }) => true,
      (WalkStart::Gap { token: a }, WalkStart::Gap { token: b }) => a == b,
      _ => false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
  /// The server has no older history; the frontier is complete
  HistoryExhausted,
  /// Event or time budget spent; the next walk resumes at the last page boundary
  BudgetExhausted,
  /// Hit an event that was already stored
  ReachedStoredHistory,
  /// The frontier was already complete, nothing was requested
  AlreadyComplete,
  /// The server refused the history request
  Rejected,
  Cancelled,
}

impl StopReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      StopReason::HistoryExhausted => "history_exhausted",
      StopReason::BudgetExhausted => "budget_exhausted",
      StopReason::ReachedStoredHistory => "reached_stored_history",
      StopReason::AlreadyComplete => "already_complete",
      StopReason::Rejected => "rejected",
      StopReason::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for StopReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Duplicates a walk expects before it reaches history nobody has stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
  None,
  /// Starting at the live end, where live ingestion already stored events
  UntilInsert,
  /// Resuming inside a page an earlier walk partly wrote
  FirstPage,
}

impl Overlap {
  fn expects_duplicates(self) -> bool {
    !matches!(self, Overlap::None)
  }

  fn after_insert(self) -> Self {
    match self {
      Overlap::UntilInsert => Overlap::None,
      other => other,
    }
  }

  fn after_page(self) -> Self {
    match self {
      Overlap::FirstPage => Overlap::None,
      other => other,
    }
  }
}

/// Outcome of one walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
  pub source_id: String,
  pub inserted: usize,
  pub duplicates: usize,
  pub malformed: usize,
  pub pages: usize,
  pub stop: StopReason,
  /// Where to continue after a spent budget
  #[serde(skip)]
  pub resume: Option<WalkStart>,
}

impl BackfillReport {
  fn new(source_id: &str) -> Self {
    Self {
      source_id: source_id.to_string(),
      inserted: 0,
      duplicates: 0,
      malformed: 0,
      pages: 0,
      stop: StopReason::Cancelled,
      resume: None,
    }
  }

  /// Events received from the server, valid or not
  pub fn events(&self) -> usize {
    self.inserted + self.duplicates + self.malformed
  }
}

/// Per-walk limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
  pub max_events: Option<usize>,
  pub max_duration: Option<Duration>,
}

impl Budget {
  pub fn unlimited() -> Self {
    Self {
      max_events: None,
      max_duration: None,
    }
  }

  pub fn from_config(config: &BackfillConfig) -> Self {
    Self {
      max_events: (config.max_events_per_run > 0).then_some(config.max_events_per_run),
      max_duration: (config.max_run_secs > 0).then(|| Duration::from_secs(config.max_run_secs)),
    }
  }

  fn spent(&self, events: usize, elapsed: Duration) -> bool {
    self.max_events.is_some_and(|max| events >= max) || self.max_duration.is_some_and(|max| elapsed >= max)
  }
}

pub struct BackfillCoordinator {
  source: Arc<dyn MessageSource>,
  writer: Arc<EventWriter>,
  pacer: Arc<Pacer>,
  batch_size: usize,
  budget: Budget,
  source_delay: Duration,
}

impl BackfillCoordinator {
  pub fn new(source: Arc<dyn MessageSource>, writer: Arc<EventWriter>, config: &BackfillConfig) -> Self {
    Self {
      source,
      writer,
      pacer: Arc::new(Pacer::new(Duration::from_millis(config.pacing_ms))),
      batch_size: config.batch_size.max(1),
      budget: Budget::from_config(config),
      source_delay: Duration::from_millis(config.source_delay_ms),
    }
  }

  pub fn with_budget(mut self, budget: Budget) -> Self {
    self.budget = budget;
    self
  }

  pub fn budget(&self) -> Budget {
    self.budget
  }

  /// Walk one room backwards from `start` until a stop condition
  #[tracing::instrument(level = "debug", skip_all, fields(source_id = %source_id))]
  pub async fn backfill_source(&self, source_id: &str, start: WalkStart, cancel: &CancellationToken) -> BackfillReport {
    let mut report = BackfillReport::new(source_id);

    let (mut frontier, mut gap, mut before, mut overlap) = match start {
      WalkStart::Gap { token } => match self.open_gap(source_id, token, cancel).await {
        Ok((gap, overlap)) => {
          let before = Some(gap.resume_token().to_string());
          (None, Some(gap), before, overlap)
        }
        Err(Cancelled) => return report,
      },
      WalkStart::Frontier { seed } => match self.open_frontier(source_id, seed, cancel).await {
        Ok(Some((frontier, overlap))) => {
          let before = frontier.before_token.clone();
          (Some(frontier), None, before, overlap)
        }
        Ok(None) => {
          debug!("Frontier complete, nothing to backfill");
          report.stop = StopReason::AlreadyComplete;
          return report;
        }
        Err(Cancelled) => return report,
      },
    };

    let started = Instant::now();

    report.stop = 'walk: loop {
      if cancel.is_cancelled() {
        break StopReason::Cancelled;
      }
      if self.budget.spent(report.events(), started.elapsed()) {
        break StopReason::BudgetExhausted;
      }

      let page = match self.fetch_page(source_id, before.as_deref(), cancel).await {
        Ok(page) => page,
        Err(stop) => break stop,
      };

      let HistoryPage {
        events,
        next_before_token,
        has_more,
      } = page;

      for raw in events {
        let event = match Event::from_raw(source_id, raw, EventOrigin::Backfill) {
          Ok(event) => event,
          Err(e) => {
            warn!(err = %e, "Dropping malformed history event");
            report.malformed += 1;
            continue;
          }
        };

        match self.writer.write(&event, cancel).await {
          Ok(WriteOutcome::Inserted) => {
            report.inserted += 1;
            overlap = overlap.after_insert();
            if let Some(frontier) = frontier.as_mut() {
              frontier.retreat(&event);
            }
          }
          Ok(_) => {
            report.duplicates += 1;
            if !overlap.expects_duplicates() {
              debug!(identity = %event.identity, "Reached stored history");
              break 'walk StopReason::ReachedStoredHistory;
            }
          }
          Err(Cancelled) => break 'walk StopReason::Cancelled,
        }
      }
      report.pages += 1;
      overlap = overlap.after_page();

      let Some(next) = next_before_token.filter(|_| has_more) else {
        if let Some(frontier) = frontier.as_mut() {
          frontier.mark_complete();
        }
        break StopReason::HistoryExhausted;
      };

      debug!(
        page = report.pages,
        inserted = report.inserted,
        duplicates = report.duplicates,
        "History page processed"
      );
      if let Some(frontier) = frontier.as_mut() {
        frontier.checkpoint(Some(next.clone()));
        if self.save_frontier(frontier, cancel).await.is_err() {
          break StopReason::Cancelled;
        }
      }
      if let Some(gap) = gap.as_mut() {
        gap.checkpoint(next.clone());
        if self.save_gap(gap, cancel).await.is_err() {
          break StopReason::Cancelled;
        }
      }
      before = Some(next);
    };

    if report.stop == StopReason::BudgetExhausted {
      report.resume = match &gap {
        Some(gap) => Some(WalkStart::Gap {
          token: gap.token.clone(),
        }),
        None => Some(WalkStart::Frontier { seed: None }),
      };
    }

    if let Some(gap) = &gap
      && matches!(report.stop, StopReason::HistoryExhausted | StopReason::ReachedStoredHistory)
    {
      let store = self.writer.store();
      let (gap_source, gap_token) = (gap.source_id.as_str(), gap.token.as_str());
      let removed = retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "remove_gap", move |_| {
        store.remove_gap(gap_source, gap_token)
      })
      .await;
      if removed.is_err() {
        warn!(token = %gap.token, "Gap not removed before shutdown, it will be walked again");
      }
    }

    if let Some(frontier) = &frontier
      && self.save_frontier(frontier, cancel).await.is_err()
    {
      warn!("Frontier not saved before shutdown, the last page will be walked again");
    }

    info!(
      stop = %report.stop,
      pages = report.pages,
      inserted = report.inserted,
      duplicates = report.duplicates,
      malformed = report.malformed,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "Backfill walk finished"
    );
    report
  }

  /// Backfill every joined room in turn: its pending gaps first, then its
  /// frontier
  pub async fn backfill_all(&self, cancel: &CancellationToken) -> Result<Vec<BackfillReport>, SourceError> {
    let Some(sources) = self.joined_sources(cancel).await? else {
      return Ok(Vec::new());
    };
    let Ok(gaps) = self.pending_gaps(cancel).await else {
      return Ok(Vec::new());
    };
    info!(sources = sources.len(), gaps = gaps.len(), "Backfilling joined rooms");

    let mut reports = Vec::with_capacity(sources.len());
    for (i, source_id) in sources.iter().enumerate() {
      if i > 0 && !sleep_or_cancel(self.source_delay, cancel).await {
        break;
      }
      let walks = self.walk_room(source_id, &gaps, cancel).await;
      let cancelled = walks.iter().any(|r| r.stop == StopReason::Cancelled);
      reports.extend(walks);
      if cancelled {
        break;
      }
    }
    Ok(reports)
  }

  /// Fill one room's pending gaps, then continue its frontier walk
  pub async fn backfill_room(&self, source_id: &str, cancel: &CancellationToken) -> Vec<BackfillReport> {
    match self.pending_gaps(cancel).await {
      Ok(gaps) => self.walk_room(source_id, &gaps, cancel).await,
      Err(Cancelled) => Vec::new(),
    }
  }

  async fn walk_room(&self, source_id: &str, gaps: &[Gap], cancel: &CancellationToken) -> Vec<BackfillReport> {
    let starts = gaps
      .iter()
      .filter(|gap| gap.source_id == source_id)
      .map(|gap| WalkStart::Gap {
        token: gap.token.clone(),
      })
      .chain([WalkStart::Frontier { seed: None }]);

    let mut reports = Vec::new();
    for start in starts {
      let report = self.backfill_source(source_id, start, cancel).await;
      let stop = report.stop;
      reports.push(report);
      if stop == StopReason::Cancelled {
        break;
      }
    }
    reports
  }

  /// Gaps left over from earlier runs
  pub async fn pending_gaps(&self, cancel: &CancellationToken) -> Result<Vec<Gap>, Cancelled> {
    let store = self.writer.store();
    retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "pending_gaps", move |_| {
      store.pending_gaps()
    })
    .await
  }

  /// Joined rooms, retrying transient failures. `None` if cancelled.
  pub async fn joined_sources(&self, cancel: &CancellationToken) -> Result<Option<Vec<String>>, SourceError> {
    retry_transient(self.writer.backoff().as_ref(), cancel, "joined_rooms", || self.source.joined_sources()).await
  }

  /// Load the room's frontier or start a new one. `Ok(None)` when the
  /// frontier is already complete.
  async fn open_frontier(
    &self,
    source_id: &str,
    seed: Option<String>,
    cancel: &CancellationToken,
  ) -> Result<Option<(Frontier, Overlap)>, Cancelled> {
    let store = self.writer.store();
    let backoff = self.writer.backoff().as_ref();

    let stored = retry_until_cancelled(backoff, cancel, "load_frontier", move |_| store.frontier(source_id)).await?;
    if let Some(frontier) = stored {
      if frontier.complete {
        return Ok(None);
      }
      debug!(before = ?frontier.before_token, oldest = ?frontier.oldest_timestamp, "Resuming frontier");
      // The page after the checkpoint may have been partly written
      let overlap = match frontier.before_token {
        Some(_) => Overlap::FirstPage,
        None => Overlap::UntilInsert,
      };
      return Ok(Some((frontier, overlap)));
    }

    let overlap = if seed.is_none() { Overlap::UntilInsert } else { Overlap::None };
    let mut frontier = Frontier::new(source_id, seed);
    let earliest =
      retry_until_cancelled(backoff, cancel, "earliest_known", move |_| store.earliest_known(source_id)).await?;
    if let Some((ts, identity)) = earliest {
      frontier.oldest_timestamp = Some(ts);
      frontier.oldest_event_id = Some(identity);
    }
    debug!(seeded = frontier.before_token.is_some(), "Starting new frontier");
    Ok(Some((frontier, overlap)))
  }

  /// Load the gap, or record it if this walk is the first to see it. A gap
  /// that an earlier walk started resumes at its checkpoint.
  async fn open_gap(&self, source_id: &str, token: String, cancel: &CancellationToken) -> Result<(Gap, Overlap), Cancelled> {
    let store = self.writer.store();
    let key = token.as_str();
    let stored = retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "load_gap", move |_| {
      store.gap(source_id, key)
    })
    .await?;

    let mut gap = stored.unwrap_or_else(|| Gap::new(source_id, token.clone()));
    if gap.started() {
      debug!(token = %gap.token, before = ?gap.before_token, "Resuming gap");
      return Ok((gap, Overlap::FirstPage));
    }

    gap.checkpoint(token);
    self.save_gap(&gap, cancel).await?;
    Ok((gap, Overlap::None))
  }

  async fn save_gap(&self, gap: &Gap, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let store = self.writer.store();
    retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "save_gap", move |_| store.save_gap(gap)).await
  }

  async fn save_frontier(&self, frontier: &Frontier, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let store = self.writer.store();
    retry_until_cancelled(self.writer.backoff().as_ref(), cancel, "save_frontier", move |_| {
      store.save_frontier(frontier)
    })
    .await
  }

  /// One paced history request, retrying transient failures
  async fn fetch_page(
    &self,
    source_id: &str,
    before: Option<&str>,
    cancel: &CancellationToken,
  ) -> Result<HistoryPage, StopReason> {
    let mut attempt = 0u32;
    loop {
      if !self.pacer.wait(cancel).await {
        return Err(StopReason::Cancelled);
      }

      let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StopReason::Cancelled),
        r = self.source.history(source_id, before, self.batch_size) => r,
      };

      match result {
        Ok(page) => return Ok(page),
        Err(e) if e.is_transient() => {
          let delay = self.writer.backoff().delay(attempt);
          warn!(
            attempt = attempt + 1,
            backoff_ms = delay.as_millis() as u64,
            err = %e,
            "History request failed, retrying"
          );
          if !sleep_or_cancel(delay, cancel).await {
            return Err(StopReason::Cancelled);
          }
          attempt = attempt.saturating_add(1);
        }
        Err(e) => {
          error!(err = %e, "History request refused");
          return Err(StopReason::Rejected);
        }
      }
    }
  }
}
