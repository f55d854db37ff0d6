//! Per-event extension point.
//!
//! Handlers run after an event is durably stored and cached, once per
//! identity, for both live and backfilled events (`event.origin` tells them
//! apart). A failing handler is logged and never blocks ingestion.

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use mxindex_core::Event;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait EventHandler: Send + Sync {
  fn name(&self) -> &str;

  async fn on_event(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Counts inserted events by kind
#[derive(Debug, Default)]
pub struct CountingHandler {
  messages: AtomicU64,
  other: AtomicU64,
}

impl CountingHandler {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn messages(&self) -> u64 {
    self.messages.load(Ordering::Relaxed)
  }

  pub fn other(&self) -> u64 {
    self.other.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl EventHandler for CountingHandler {
  fn name(&self) -> &str {
    "counting"
  }

  async fn on_event(&self, event: &Event) -> Result<(), HandlerError> {
    if event.is_message() {
      self.messages.fetch_add(1, Ordering::Relaxed);
    } else {
      self.other.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
  }
}
