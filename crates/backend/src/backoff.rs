// Retry delays for reconnects and store retries
//
// Retries never give up: the policy only decides how long to wait before the
// next attempt. Tests inject `NoBackoff` or a fixed policy so timing is
// deterministic.

use std::{fmt::Display, future::Future, time::Duration};

use mxindex_core::StreamConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub trait BackoffPolicy: Send + Sync {
  /// Delay before retry number `attempt` (0-based)
  fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with a ceiling and up to 25% jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
  pub initial: Duration,
  pub max: Duration,
  pub multiplier: f64,
  pub jitter: bool,
}

impl Default for ExponentialBackoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_secs(1),
      max: Duration::from_secs(60),
      multiplier: 2.0,
      jitter: true,
    }
  }
}

impl ExponentialBackoff {
  pub fn from_config(config: &StreamConfig) -> Self {
    Self {
      initial: Duration::from_millis(config.initial_backoff_ms),
      max: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
      ..Default::default()
    }
  }
}

impl BackoffPolicy for ExponentialBackoff {
  fn delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.min(63) as i32;
    let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
    let mut backoff = Duration::from_secs_f64(base.min(self.max.as_secs_f64()));

    if self.jitter {
      let jitter_factor = 1.0 + rand::random::<f64>() * 0.25;
      backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
    }

    backoff.min(self.max)
  }
}

/// Same delay every time
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffPolicy for FixedBackoff {
  fn delay(&self, _attempt: u32) -> Duration {
    self.0
  }
}

/// Retry immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
  fn delay(&self, _attempt: u32) -> Duration {
    Duration::ZERO
  }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
  if delay.is_zero() {
    tokio::task::yield_now().await;
    return !cancel.is_cancelled();
  }
  tokio::select! {
    biased;
    _ = cancel.cancelled() => false,
    _ = tokio::time::sleep(delay) => true,
  }
}

/// The operation was abandoned because shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Run `op` until it succeeds, sleeping per `policy` between failures.
///
/// `op` receives the 0-based attempt number. Only cancellation stops the loop.
pub async fn retry_until_cancelled<T, E, F, Fut>(
  policy: &dyn BackoffPolicy,
  cancel: &CancellationToken,
  what: &'static str,
  mut op: F,
) -> Result<T, Cancelled>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Display,
{
  let mut attempt = 0u32;
  loop {
    match op(attempt).await {
      Ok(value) => return Ok(value),
      Err(e) => {
        let delay = policy.delay(attempt);
        warn!(
          operation = what,
          attempt = attempt + 1,
          backoff_ms = delay.as_millis() as u64,
          err = %e,
          "Operation failed, retrying"
        );
        if !sleep_or_cancel(delay, cancel).await {
          return Err(Cancelled);
        }
        attempt = attempt.saturating_add(1);
      }
    }
  }
}
