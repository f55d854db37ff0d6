//! Daemon lifecycle.
//!
//! # Architecture
//!
//! ```text
//! Daemon (supervisor)
//!   ├── StreamClient        sync long-poll, persists the stream token after ack
//!   ├── IngestCoordinator   cache -> store -> cursor, per delivered batch
//!   └── BackfillScheduler   paced history walks on a bounded worker pool
//! ```
//!
//! # Lifecycle
//!
//! 1. Create master `CancellationToken`, hook ctrl-c and SIGTERM to it
//! 2. Open the event store (LanceDB, or in memory when ephemeral)
//! 3. Authenticate with the homeserver, backing off while it is unreachable;
//!    rejected credentials are fatal
//! 4. Spawn ingestion and the backfill scheduler with child tokens, queueing
//!    gaps left pending by earlier runs
//! 5. Run the stream loop until it stops or shutdown is requested
//! 6. Cancel children and await every task before returning

use std::{sync::Arc, time::Duration};

use mxindex_core::{Config, ConfigError};
use thiserror::Error;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  backfill::{BackfillCoordinator, BackfillRequest, BackfillScheduler},
  backoff::ExponentialBackoff,
  cache::RecencyCache,
  dirs,
  handler::CountingHandler,
  ingest::IngestCoordinator,
  matrix::{MatrixClient, MessageSource, SourceError, retry_transient},
  store::{EventStore, LanceEventStore, MemoryEventStore, StoreError},
  stream::{StreamClient, StreamError, StreamExit},
  writer::EventWriter,
};

/// Capacity of the backfill request channel
const BACKFILL_QUEUE: usize = 256;

#[derive(Error, Debug)]
pub enum DaemonError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("Homeserver rejected credentials: {0}")]
  Auth(SourceError),
  #[error("Homeserver unavailable: {0}")]
  Source(SourceError),
  #[error("Event store error: {0}")]
  Store(#[from] StoreError),
}

impl From<SourceError> for DaemonError {
  fn from(e: SourceError) -> Self {
    if e.is_auth() {
      DaemonError::Auth(e)
    } else {
      DaemonError::Source(e)
    }
  }
}

impl From<StreamError> for DaemonError {
  fn from(e: StreamError) -> Self {
    match e {
      StreamError::Auth(e) => DaemonError::Auth(e),
    }
  }
}

// ============================================================================
// Configuration
// ============================================================================

/// Daemon runtime configuration.
///
/// The loaded config plus the switches given on the command line.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  pub config: Config,
  /// Log to the console instead of the log file
  pub foreground: bool,
  /// Keep everything in memory; nothing survives the process
  pub ephemeral: bool,
}

impl RuntimeConfig {
  pub fn load() -> Result<Self, ConfigError> {
    Self::ensure_user_config();
    Ok(Self {
      config: Config::load()?,
      foreground: false,
      ephemeral: false,
    })
  }

  /// Write the config template on first run so there is something to edit
  fn ensure_user_config() {
    let Some(path) = Config::user_config_path() else {
      return;
    };
    if path.exists() {
      return;
    }

    if let Some(parent) = path.parent()
      && let Err(e) = std::fs::create_dir_all(parent)
    {
      warn!(err = %e, "Failed to create config directory");
      return;
    }

    match std::fs::write(&path, Config::generate_template()) {
      Ok(()) => info!(path = %path.display(), "Created user config"),
      Err(e) => warn!(err = %e, "Failed to create user config"),
    }
  }
}

/// Open the store named by the config as its only writer, or an in-memory one
pub async fn open_store(config: &Config, ephemeral: bool) -> Result<Arc<dyn EventStore>, StoreError> {
  if ephemeral {
    info!("Using in-memory event store");
    return Ok(Arc::new(MemoryEventStore::new()));
  }

  let store = LanceEventStore::open_exclusive(&dirs::store_path(config))
    .await?
    .with_optimize_every(config.store.optimize_every);
  let created = store.ensure_indexes().await;
  if created > 0 {
    info!(created, "Created event indexes");
  }
  Ok(Arc::new(store))
}

/// Open an existing store for queries while a writer may be running. Takes
/// no lock, creates nothing and leaves index maintenance to the writer.
pub async fn open_store_read_only(config: &Config) -> Result<Arc<dyn EventStore>, StoreError> {
  Ok(Arc::new(LanceEventStore::open_read_only(&dirs::store_path(config)).await?))
}

// ============================================================================
// Daemon
// ============================================================================

pub struct Daemon {
  runtime: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime: RuntimeConfig) -> Self {
    Self { runtime }
  }

  /// Run until ctrl-c, SIGTERM or a fatal error
  pub async fn run(self) -> Result<(), DaemonError> {
    // Master cancellation token - propagates to all children
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());
    self.serve(cancel).await
  }

  /// Open the store, log in and run the pipeline until `cancel` fires
  pub async fn serve(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
    let config = &self.runtime.config;
    config.validate()?;

    info!(
      homeserver = %config.matrix.homeserver,
      user_id = %config.matrix.user_id,
      ephemeral = self.runtime.ephemeral,
      backfill = config.backfill.enabled,
      "Starting mxindex daemon"
    );

    let store = open_store(config, self.runtime.ephemeral).await?;

    // Transient failures retry forever; auth and rejected requests are fatal
    let backoff = ExponentialBackoff::from_config(&config.stream);
    let login = retry_transient(&backoff, &cancel, "login", || MatrixClient::connect(&config.matrix))
      .await
      .inspect_err(|e| error!(err = %e, "Login failed"))?;
    let Some(client) = login else {
      info!("Shutdown requested before login completed");
      return Ok(());
    };
    info!(user_id = client.user_id(), "Authenticated");

    self.run_with(Arc::new(client), store, cancel).await
  }

  /// Run the ingestion pipeline against an already connected source
  pub async fn run_with(
    &self,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn EventStore>,
    cancel: CancellationToken,
  ) -> Result<(), DaemonError> {
    let config = &self.runtime.config;
    let backoff = Arc::new(ExponentialBackoff::from_config(&config.stream));
    let counter = CountingHandler::new();
    let writer = Arc::new(
      EventWriter::new(
        Arc::new(RecencyCache::new(config.cache.capacity)),
        store.clone(),
        backoff.clone(),
      )
      .with_handler(counter.clone()),
    );

    let mut ingest = IngestCoordinator::new(writer.clone());
    let mut tasks = Vec::new();

    if config.backfill.enabled {
      let (requests, inbox) = mpsc::channel(BACKFILL_QUEUE);
      ingest = ingest.with_backfill(requests.clone());

      let coordinator = Arc::new(BackfillCoordinator::new(source.clone(), writer.clone(), &config.backfill));
      let scheduler = BackfillScheduler::new(coordinator.clone(), config.backfill.workers);
      let scheduler_cancel = cancel.child_token();
      tasks.push(tokio::spawn(async move {
        let reports = scheduler.run(inbox, scheduler_cancel).await;
        let inserted: usize = reports.iter().map(|r| r.inserted).sum();
        debug!(walks = reports.len(), inserted, "Backfill reports collected");
      }));

      // Resume gaps left by earlier runs, then every joined room's frontier;
      // rooms seen in sync are coalesced
      let resume_cancel = cancel.child_token();
      tasks.push(tokio::spawn(async move {
        let Ok(gaps) = coordinator.pending_gaps(&resume_cancel).await else {
          return;
        };
        if !gaps.is_empty() {
          info!(gaps = gaps.len(), "Resuming pending gaps");
        }
        for gap in gaps {
          let request = BackfillRequest::Gap {
            source_id: gap.source_id,
            token: gap.token,
          };
          if requests.send(request).await.is_err() {
            return;
          }
        }

        match coordinator.joined_sources(&resume_cancel).await {
          Ok(Some(sources)) => {
            info!(sources = sources.len(), "Scheduling backfill for joined rooms");
            for source_id in sources {
              let request = BackfillRequest::Source {
                source_id,
                prev_batch: None,
              };
              if requests.send(request).await.is_err() {
                break;
              }
            }
          }
          Ok(None) => {}
          Err(e) => warn!(err = %e, "Could not list joined rooms for backfill"),
        }
      }));
    } else {
      info!("Backfill disabled");
    }

    let ingest = Arc::new(ingest);
    let (deliveries, delivery_inbox) = mpsc::channel(config.stream.channel_capacity.max(1));
    {
      let ingest = ingest.clone();
      let cancel = cancel.child_token();
      tasks.push(tokio::spawn(async move { ingest.run(delivery_inbox, cancel).await }));
    }

    let stream = StreamClient::new(
      source,
      store,
      backoff,
      Duration::from_millis(config.stream.sync_timeout_ms),
    );
    let exit = stream.run(deliveries, cancel.child_token()).await;

    info!("Shutting down...");
    cancel.cancel();
    for task in tasks {
      if let Err(e) = task.await {
        warn!(err = %e, "Task failed during shutdown");
      }
    }

    let stats = ingest.snapshot();
    info!(
      inserted = stats.inserted,
      duplicates = stats.duplicates,
      malformed = stats.malformed,
      messages = counter.messages(),
      other = counter.other(),
      "Daemon shutdown complete"
    );

    match exit {
      Ok(StreamExit::Cancelled) => Ok(()),
      Ok(StreamExit::ConsumerClosed) => {
        warn!("Ingestion stopped before the stream");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }
}

/// Cancel `cancel` on ctrl-c or SIGTERM
fn spawn_signal_listener(cancel: CancellationToken) {
  tokio::spawn(async move {
    #[cfg(unix)]
    let terminate = async {
      match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
          sig.recv().await;
        }
        Err(e) => {
          warn!(err = %e, "Failed to listen for SIGTERM");
          std::future::pending::<()>().await;
        }
      }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
      _ = cancel.cancelled() => return,
      r = signal::ctrl_c() => {
        if let Err(e) = r {
          warn!(err = %e, "Failed to listen for ctrl-c");
          return;
        }
        info!("Received ctrl-c, shutting down...");
      }
      _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
    cancel.cancel();
  });
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use mxindex_core::Gap;

  use super::*;
  use crate::__tests__::helpers::{ScriptedSource, batch_for, raw_message, timeline};

  fn runtime() -> RuntimeConfig {
    let mut config = Config::default();
    config.backfill.pacing_ms = 0;
    config.backfill.source_delay_ms = 0;
    config.backfill.max_events_per_run = 0;
    RuntimeConfig {
      config,
      foreground: true,
      ephemeral: true,
    }
  }

  async fn wait_for_count(store: &MemoryEventStore, n: usize) {
    while store.count().await.unwrap() < n {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_live_and_backfill_fill_the_store() {
    let source = Arc::new(ScriptedSource::new());
    source.set_history("!r:x", timeline("h", 20));
    let mut batch = batch_for("s1", "!r:x", vec![raw_message("$live", 1_000_000)]);
    batch.sources[0].prev_batch = Some("t20".into());
    source.push_sync(Ok(batch));

    let store = Arc::new(MemoryEventStore::new());
    let cancel = CancellationToken::new();
    let daemon = Daemon::new(runtime());
    let run = {
      let source = source.clone();
      let store = store.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { daemon.run_with(source, store, cancel).await })
    };

    wait_for_count(&store, 21).await;
    source.wait_for_sync_calls(2).await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(store.count().await.unwrap(), 21);
    assert_eq!(store.stream_token().await.unwrap().as_deref(), Some("s1"));
    assert!(store.frontier("!r:x").await.unwrap().unwrap().complete);
    assert_eq!(
      store.latest_cursor("!r:x").await.unwrap().unwrap().last_timestamp,
      1_000_000
    );
  }

  #[tokio::test]
  async fn test_pending_gaps_are_walked_at_startup() {
    let source = Arc::new(ScriptedSource::new());
    source.set_history("!r:x", timeline("h", 30));
    let store = Arc::new(MemoryEventStore::new());
    // A gap a previous run recorded and walked one page into
    let mut gap = Gap::new("!r:x", "t30");
    gap.checkpoint("t20");
    store.add_gap(&gap).await.unwrap();

    let cancel = CancellationToken::new();
    let daemon = Daemon::new(runtime());
    let run = {
      let source = source.clone();
      let store = store.clone();
      let cancel = cancel.clone();
      tokio::spawn(async move { daemon.run_with(source, store, cancel).await })
    };

    while !store.pending_gaps().await.unwrap().is_empty() {
      tokio::task::yield_now().await;
    }
    cancel.cancel();
    run.await.unwrap().unwrap();

    assert!(store.get("$h0").await.unwrap().is_some());
    assert_eq!(source.history_requests("!r:x")[0], Some("t20".to_string()));
  }

  #[tokio::test]
  async fn test_auth_failure_is_fatal() {
    let source = Arc::new(ScriptedSource::new());
    source.push_sync(Err(SourceError::Auth("M_UNKNOWN_TOKEN".into())));
    let daemon = Daemon::new(RuntimeConfig {
      config: Config {
        backfill: mxindex_core::BackfillConfig {
          enabled: false,
          ..Default::default()
        },
        ..Config::default()
      },
      foreground: true,
      ephemeral: true,
    });

    let result = daemon
      .run_with(source, Arc::new(MemoryEventStore::new()), CancellationToken::new())
      .await;
    assert!(matches!(result, Err(DaemonError::Auth(_))));
  }

  #[tokio::test]
  async fn test_unreachable_homeserver_keeps_retrying_until_shutdown() {
    let mut config = Config::default();
    config.matrix.homeserver = "http://127.0.0.1:9".into();
    config.matrix.access_token = Some("syt_token".into());
    config.stream.initial_backoff_ms = 10;
    config.stream.max_backoff_ms = 20;
    let daemon = Daemon::new(RuntimeConfig {
      config,
      foreground: true,
      ephemeral: true,
    });

    let cancel = CancellationToken::new();
    let serve = {
      let cancel = cancel.clone();
      tokio::spawn(async move { daemon.serve(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!serve.is_finished(), "daemon exited while the homeserver was unreachable");

    cancel.cancel();
    assert!(serve.await.unwrap().is_ok());
  }

  #[tokio::test]
  async fn test_one_writer_many_readers() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.path = Some(temp_dir.path().join("lancedb"));

    // Queries against a store that was never written do not create one
    assert!(matches!(open_store_read_only(&config).await, Err(StoreError::NotFound(_))));
    assert!(!temp_dir.path().join("lancedb").exists());

    let writer = open_store(&config, false).await.unwrap();
    assert!(matches!(open_store(&config, false).await, Err(StoreError::Locked(_))));

    let reader = open_store_read_only(&config).await.unwrap();
    assert_eq!(reader.count().await.unwrap(), 0);

    drop(writer);
    assert!(open_store(&config, false).await.is_ok());
  }

  #[test]
  fn test_source_errors_map_to_daemon_errors() {
    assert!(matches!(
      DaemonError::from(SourceError::Auth("M_FORBIDDEN".into())),
      DaemonError::Auth(_)
    ));
    assert!(matches!(DaemonError::from(SourceError::Timeout), DaemonError::Source(_)));
  }
}
