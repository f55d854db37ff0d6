//! Long-lived sync stream.
//!
//! ```text
//! Disconnected -> Connecting{attempt} -> Synced
//!                      ^                   |
//!                      |                   v (I/O or server error)
//!                      +------------ Degraded{attempt}
//! ```
//!
//! Each sync response is handed to the ingestion coordinator as a
//! [`Delivery`]. The continuation token is persisted only after the delivery
//! is acknowledged, so a restart re-requests everything that was not durably
//! processed. Replays are expected downstream and are idempotent there.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
  backoff::{BackoffPolicy, retry_until_cancelled, sleep_or_cancel},
  matrix::{MessageSource, SourceError, SyncBatch},
  store::EventStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
  Disconnected,
  Connecting { attempt: u32 },
  Synced,
  Degraded { attempt: u32 },
}

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("Authentication rejected by homeserver: {0}")]
  Auth(SourceError),
}

/// Why the stream loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
  Cancelled,
  /// The consumer went away or dropped a delivery without acknowledging it
  ConsumerClosed,
}

/// A sync batch awaiting durable processing
#[derive(Debug)]
pub struct Delivery {
  pub batch: SyncBatch,
  ack: oneshot::Sender<()>,
}

impl Delivery {
  pub fn new(batch: SyncBatch) -> (Self, oneshot::Receiver<()>) {
    let (ack, rx) = oneshot::channel();
    (Self { batch, ack }, rx)
  }

  /// Confirm every event in the batch is durably stored
  pub fn acknowledge(self) {
    let _ = self.ack.send(());
  }
}

pub struct StreamClient {
  source: Arc<dyn MessageSource>,
  store: Arc<dyn EventStore>,
  backoff: Arc<dyn BackoffPolicy>,
  sync_timeout: Duration,
  state: watch::Sender<StreamState>,
}

impl StreamClient {
  pub fn new(
    source: Arc<dyn MessageSource>,
    store: Arc<dyn EventStore>,
    backoff: Arc<dyn BackoffPolicy>,
    sync_timeout: Duration,
  ) -> Self {
    let (state, _) = watch::channel(StreamState::Disconnected);
    Self {
      source,
      store,
      backoff,
      sync_timeout,
      state,
    }
  }

  /// Observe state transitions
  pub fn subscribe(&self) -> watch::Receiver<StreamState> {
    self.state.subscribe()
  }

  fn transition(&self, next: StreamState) {
    let prev = *self.state.borrow();
    if prev != next {
      debug!(from = ?prev, to = ?next, "Stream state transition");
      self.state.send_replace(next);
    }
  }

  /// Run until cancelled, the consumer goes away, or credentials are rejected
  pub async fn run(
    &self,
    deliveries: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
  ) -> Result<StreamExit, StreamError> {
    let exit = self.run_inner(&deliveries, &cancel).await;
    self.transition(StreamState::Disconnected);
    match &exit {
      Ok(reason) => info!(reason = ?reason, "Stream stopped"),
      Err(e) => error!(err = %e, "Stream stopped"),
    }
    exit
  }

  async fn run_inner(
    &self,
    deliveries: &mpsc::Sender<Delivery>,
    cancel: &CancellationToken,
  ) -> Result<StreamExit, StreamError> {
    let store = &self.store;
    let Ok(mut since) = retry_until_cancelled(self.backoff.as_ref(), cancel, "load_stream_token", move |_| {
      store.stream_token()
    })
    .await
    else {
      return Ok(StreamExit::Cancelled);
    };

    info!(resume = since.is_some(), "Stream starting");
    let mut attempt = 0u32;
    self.transition(StreamState::Connecting { attempt });

    loop {
      if cancel.is_cancelled() {
        return Ok(StreamExit::Cancelled);
      }

      let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(StreamExit::Cancelled),
        r = self.source.next_batch(since.as_deref(), self.sync_timeout) => r,
      };

      let batch = match result {
        Ok(batch) => batch,
        Err(e) if e.is_auth() => return Err(StreamError::Auth(e)),
        Err(e) => {
          self.transition(StreamState::Degraded { attempt });
          let delay = self.backoff.delay(attempt);
          warn!(
            attempt = attempt + 1,
            backoff_ms = delay.as_millis() as u64,
            err = %e,
            "Sync failed, reconnecting after backoff"
          );
          if !sleep_or_cancel(delay, cancel).await {
            return Ok(StreamExit::Cancelled);
          }
          attempt = attempt.saturating_add(1);
          self.transition(StreamState::Connecting { attempt });
          continue;
        }
      };

      if !matches!(*self.state.borrow(), StreamState::Synced) {
        info!(attempts = attempt + 1, "Stream synced");
      }
      attempt = 0;
      self.transition(StreamState::Synced);

      let next_token = batch.next_token.clone();
      if batch.sources.is_empty() {
        trace!(next = %next_token, "Keep-alive tick");
      } else {
        let events = batch.event_count();
        let (delivery, ack) = Delivery::new(batch);
        if deliveries.send(delivery).await.is_err() {
          debug!("Delivery channel closed");
          return Ok(StreamExit::ConsumerClosed);
        }
        // The consumer finishes in-flight work before acknowledging or dropping
        if ack.await.is_err() {
          warn!(next = %next_token, events, "Batch not acknowledged, token not persisted");
          return Ok(StreamExit::ConsumerClosed);
        }
      }

      let token = next_token.as_str();
      if retry_until_cancelled(self.backoff.as_ref(), cancel, "save_stream_token", move |_| {
        store.save_stream_token(token)
      })
      .await
      .is_err()
      {
        return Ok(StreamExit::Cancelled);
      }
      since = Some(next_token);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use pretty_assertions::assert_eq;

  use super::*;
  use crate::{
    __tests__::helpers::{ScriptedSource, batch_for, raw_message},
    backoff::{FixedBackoff, NoBackoff},
    store::MemoryEventStore,
  };

  fn client(source: Arc<ScriptedSource>, store: Arc<MemoryEventStore>, backoff: Arc<dyn BackoffPolicy>) -> StreamClient {
    StreamClient::new(source, store, backoff, Duration::from_secs(30))
  }

  #[tokio::test]
  async fn test_token_persisted_only_after_ack() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Ok(batch_for("s1", "!r:x", vec![raw_message("$a", 1)])));
    let store = Arc::new(MemoryEventStore::new());
    let client = client(source.clone(), store.clone(), Arc::new(NoBackoff));

    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let run = {
      let cancel = cancel.clone();
      async move { client.run(tx, cancel).await }
    };
    let handle = tokio::spawn(run);

    let delivery = rx.recv().await.unwrap();
    assert_eq!(delivery.batch.next_token, "s1");
    assert_eq!(store.stream_token().await.unwrap(), None, "token must wait for the ack");

    delivery.acknowledge();
    // The scripted source blocks once empty; wait for the follow-up request
    source.wait_for_sync_calls(2).await;
    assert_eq!(store.stream_token().await.unwrap().as_deref(), Some("s1"));
    assert_eq!(source.sync_since(1), Some("s1".to_string()));

    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), StreamExit::Cancelled);
  }

  #[tokio::test]
  async fn test_dropped_delivery_stops_without_persisting() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Ok(batch_for("s1", "!r:x", vec![raw_message("$a", 1)])));
    let store = Arc::new(MemoryEventStore::new());
    let client = client(source, store.clone(), Arc::new(NoBackoff));

    let (tx, mut rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move { client.run(tx, CancellationToken::new()).await });

    drop(rx.recv().await.unwrap());
    assert_eq!(handle.await.unwrap().unwrap(), StreamExit::ConsumerClosed);
    assert_eq!(store.stream_token().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_resumes_from_persisted_token() {
    let source = Arc::new(ScriptedSource::new());
    let store = Arc::new(MemoryEventStore::new());
    store.save_stream_token("s41").await.unwrap();
    let client = client(source.clone(), store, Arc::new(NoBackoff));

    let (tx, _rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let handle = {
      let cancel = cancel.clone();
      tokio::spawn(async move { client.run(tx, cancel).await })
    };

    source.wait_for_sync_calls(1).await;
    assert_eq!(source.sync_since(0), Some("s41".to_string()));
    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), StreamExit::Cancelled);
  }

  #[tokio::test(start_paused = true)]
  async fn test_degrades_and_reconnects_with_backoff() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Err(SourceError::Network("connection reset".into())));
    source.push_sync(Err(SourceError::Timeout));
    source.push_sync(Ok(batch_for("s1", "!r:x", vec![raw_message("$a", 1)])));
    let store = Arc::new(MemoryEventStore::new());
    let client = client(source.clone(), store, Arc::new(FixedBackoff(Duration::from_secs(5))));
    let mut states = client.subscribe();

    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let handle = {
      let cancel = cancel.clone();
      tokio::spawn(async move { client.run(tx, cancel).await })
    };

    let started = tokio::time::Instant::now();
    let mut seen = Vec::new();
    loop {
      states.changed().await.unwrap();
      let state = *states.borrow_and_update();
      seen.push(state);
      if state == StreamState::Synced {
        break;
      }
    }
    assert!(seen.contains(&StreamState::Degraded { attempt: 0 }));
    assert!(seen.contains(&StreamState::Degraded { attempt: 1 }));
    assert_eq!(started.elapsed(), Duration::from_secs(10));

    rx.recv().await.unwrap().acknowledge();
    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap(), StreamExit::Cancelled);
  }

  #[tokio::test]
  async fn test_auth_failure_is_fatal() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Err(SourceError::Auth("M_UNKNOWN_TOKEN".into())));
    let client = client(source.clone(), Arc::new(MemoryEventStore::new()), Arc::new(NoBackoff));
    let states = client.subscribe();

    let (tx, _rx) = mpsc::channel(1);
    let result = client.run(tx, CancellationToken::new()).await;

    assert!(matches!(result, Err(StreamError::Auth(_))));
    assert_eq!(*states.borrow(), StreamState::Disconnected);
    assert_eq!(source.sync_calls(), 1, "auth failures are not retried");
  }

  #[tokio::test]
  async fn test_keep_alive_ticks_advance_token_without_delivery() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Ok(SyncBatch {
      next_token: "s2".into(),
      sources: vec![],
    }));
    let store = Arc::new(MemoryEventStore::new());
    let client = client(source.clone(), store.clone(), Arc::new(NoBackoff));

    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let handle = {
      let cancel = cancel.clone();
      tokio::spawn(async move { client.run(tx, cancel).await })
    };

    source.wait_for_sync_calls(2).await;
    assert_eq!(store.stream_token().await.unwrap().as_deref(), Some("s2"));
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    handle.await.unwrap().unwrap();
  }
}
