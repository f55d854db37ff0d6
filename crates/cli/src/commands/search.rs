//! Search commands against the local event store

use anyhow::{Context, Result, bail};
use chrono::{Days, NaiveDate};
use mxindex::open_store_read_only;
use mxindex_core::{Config, EventFilter};

use crate::format::format_events;

/// What to search for, as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchQuery {
  Room(String),
  User(String),
  Text(String),
  Date { start: String, end: Option<String> },
  Type(String),
}

impl SearchQuery {
  fn into_filter(self) -> Result<EventFilter> {
    Ok(match self {
      SearchQuery::Room(room) => EventFilter::Source(room),
      SearchQuery::User(user) => EventFilter::Sender(user),
      SearchQuery::Text(text) => {
        if text.trim().is_empty() {
          bail!("Search text must not be empty");
        }
        EventFilter::Text(text)
      }
      SearchQuery::Date { start, end } => {
        let (start_ms, end_ms) = date_range(&start, end.as_deref().unwrap_or(&start))?;
        EventFilter::TimeRange { start_ms, end_ms }
      }
      SearchQuery::Type(kind) => EventFilter::Kind(kind),
    })
  }
}

/// `YYYY-MM-DD` bounds in UTC milliseconds. The end day is included whole.
fn date_range(start: &str, end: &str) -> Result<(i64, i64)> {
  let start = parse_day(start)?;
  let end = parse_day(end)?;
  if end < start {
    bail!("End date {} is before start date {}", end, start);
  }

  let start_ms = day_start_ms(start)?;
  let after_end = end.checked_add_days(Days::new(1)).context("End date out of range")?;
  Ok((start_ms, day_start_ms(after_end)? - 1))
}

fn parse_day(day: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(day, "%Y-%m-%d").with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", day))
}

fn day_start_ms(day: NaiveDate) -> Result<i64> {
  let midnight = day.and_hms_opt(0, 0, 0).context("Invalid date")?;
  Ok(midnight.and_utc().timestamp_millis())
}

pub async fn cmd_search(config: Config, query: SearchQuery, limit: usize, json: bool) -> Result<()> {
  let filter = query.into_filter()?;
  let store = open_store_read_only(&config).await.context("Failed to open event store")?;
  let events = store.query(&filter, limit).await.context("Search failed")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&events)?);
  } else {
    print!("{}", format_events(&events));
  }
  Ok(())
}
