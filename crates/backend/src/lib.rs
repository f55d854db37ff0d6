//! Matrix event ingestion and reconciliation.

pub mod backfill;
pub mod backoff;
pub mod cache;
pub mod dirs;
pub mod handler;
pub mod ingest;
pub mod matrix;
pub mod store;
pub mod stream;
pub mod writer;

mod daemon;
pub use daemon::{Daemon, DaemonError, RuntimeConfig, open_store, open_store_read_only};

#[cfg(test)]
mod __tests__;
