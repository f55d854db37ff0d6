// Request pacing for history walks
//
// One pacer is shared by every backfill walk so the combined request rate
// stays under the upstream limit no matter how many workers run. Each caller
// reserves the next free slot under the lock and sleeps outside it.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
pub struct Pacer {
  interval: Duration,
  next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      next_slot: Mutex::new(None),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  /// Reserve a request slot at least `interval` after the previous one
  fn reserve(&self) -> Instant {
    let now = Instant::now();
    let mut next = self.next_slot.lock();
    let slot = next.map_or(now, |n| n.max(now));
    *next = Some(slot + self.interval);
    slot
  }

  /// Wait for the next request slot. Returns false if cancelled first.
  pub async fn wait(&self, cancel: &CancellationToken) -> bool {
    if self.interval.is_zero() {
      return !cancel.is_cancelled();
    }

    let slot = self.reserve();
    let now = Instant::now();
    if slot <= now {
      return !cancel.is_cancelled();
    }

    trace!(wait_ms = (slot - now).as_millis() as u64, "Pacing history request");
    tokio::select! {
      biased;
      _ = cancel.cancelled() => false,
      _ = tokio::time::sleep_until(slot) => true,
    }
  }
}
