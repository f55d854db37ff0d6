//! Shared configuration and data model for mxindex.

pub mod config;
pub mod event;

pub use config::{BackfillConfig, CacheConfig, Config, ConfigError, MatrixConfig, StoreConfig, StreamConfig};
pub use event::{Cursor, Event, EventFilter, EventOrigin, EventSummary, Frontier, Gap, MalformedEvent};
