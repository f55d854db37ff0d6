// Backfill scheduling
//
// Requests arrive over an mpsc channel from live ingestion and the daemon.
// Each room gets one worker task that drains that room's queue in order, so
// walks for one room never overlap. A semaphore caps how many walks run at
// once across all rooms. The front of a room's queue is the walk in flight;
// a request that would repeat a queued or running walk is dropped. A walk that
// spends its budget is queued again behind the room's other work.

use std::{collections::VecDeque, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
  sync::{Semaphore, mpsc},
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackfillCoordinator, BackfillReport, BackfillRequest, WalkStart};

pub struct BackfillScheduler {
  coordinator: Arc<BackfillCoordinator>,
  permits: Arc<Semaphore>,
  queues: Arc<DashMap<String, VecDeque<WalkStart>>>,
}

impl BackfillScheduler {
  pub fn new(coordinator: Arc<BackfillCoordinator>, workers: usize) -> Self {
    Self {
      coordinator,
      permits: Arc::new(Semaphore::new(workers.max(1))),
      queues: Arc::new(DashMap::new()),
    }
  }

  /// Rooms with a walk running or queued
  pub fn active_sources(&self) -> usize {
    self.queues.len()
  }

  /// Accept requests until the channel closes or shutdown, then wait for
  /// every walk to finish. Cancelled walks checkpoint before returning.
  pub async fn run(&self, mut requests: mpsc::Receiver<BackfillRequest>, cancel: CancellationToken) -> Vec<BackfillReport> {
    let mut workers: JoinSet<Vec<BackfillReport>> = JoinSet::new();
    let mut reports = Vec::new();
    info!(workers = self.permits.available_permits(), "Backfill scheduler started");

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        Some(done) = workers.join_next(), if !workers.is_empty() => collect(done, &mut reports),
        request = requests.recv() => match request {
          Some(request) => self.enqueue(request, &mut workers, &cancel),
          None => break,
        },
      }
    }

    while let Some(done) = workers.join_next().await {
      collect(done, &mut reports);
    }
    info!(walks = reports.len(), "Backfill scheduler stopped");
    reports
  }

  fn enqueue(&self, request: BackfillRequest, workers: &mut JoinSet<Vec<BackfillReport>>, cancel: &CancellationToken) {
    let (source_id, start) = request.into_walk();

    match self.queues.entry(source_id.clone()) {
      Entry::Occupied(mut queue) => {
        if queue.get().iter().any(|queued| queued.same_walk(&start)) {
          debug!(source_id, start = ?start, "Coalesced backfill request");
        } else {
          debug!(source_id, start = ?start, "Queued backfill request");
          queue.get_mut().push_back(start);
        }
      }
      Entry::Vacant(slot) => {
        slot.insert(VecDeque::from([start]));
        let coordinator = self.coordinator.clone();
        let permits = self.permits.clone();
        let queues = self.queues.clone();
        let cancel = cancel.clone();
        workers.spawn(async move { drain_source(source_id, coordinator, permits, queues, cancel).await });
      }
    }
  }
}

/// Run one room's queued walks in order, one permit per walk
async fn drain_source(
  source_id: String,
  coordinator: Arc<BackfillCoordinator>,
  permits: Arc<Semaphore>,
  queues: Arc<DashMap<String, VecDeque<WalkStart>>>,
  cancel: CancellationToken,
) -> Vec<BackfillReport> {
  let mut reports = Vec::new();

  loop {
    let Some(start) = queues.get(&source_id).and_then(|q| q.front().cloned()) else {
      break;
    };

    let permit = tokio::select! {
      biased;
      _ = cancel.cancelled() => None,
      permit = permits.acquire() => permit.ok(),
    };
    let Some(_permit) = permit else {
      queues.remove(&source_id);
      break;
    };

    let report = coordinator.backfill_source(&source_id, start, &cancel).await;
    let resume = report.resume.clone().filter(|_| !cancel.is_cancelled());
    reports.push(report);

    // Pop the finished walk; drop the room's entry once nothing is left
    if let Entry::Occupied(mut queue) = queues.entry(source_id.clone()) {
      queue.get_mut().pop_front();
      if let Some(next) = resume
        && !queue.get().iter().any(|queued| queued.same_walk(&next))
      {
        debug!(source_id, start = ?next, "Budget spent, walk requeued");
        queue.get_mut().push_back(next);
      }
      if queue.get().is_empty() {
        queue.remove();
        break;
      }
    }
  }
  reports
}

fn collect(done: Result<Vec<BackfillReport>, tokio::task::JoinError>, reports: &mut Vec<BackfillReport>) {
  match done {
    Ok(walks) => reports.extend(walks),
    Err(e) => warn!(err = %e, "Backfill worker failed"),
  }
}
