//! Terminal formatting for search results, stats and backfill reports.

use mxindex::{backfill::BackfillReport, store::StoreStats};
use mxindex_core::{Event, event::PREVIEW_CHARS};

// ============================================================================
// Events
// ============================================================================

/// `[YYYY-MM-DD HH:MM:SS] sender: body` for messages, `[ts] kind from sender` otherwise
pub fn format_event(event: &Event) -> String {
  let ts = event
    .server_time()
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "????-??-?? ??:??:??".to_string());

  match event.body() {
    Some(body) if event.is_message() => format!("[{}] {}: {}", ts, event.sender, truncate(body, PREVIEW_CHARS)),
    _ => format!("[{}] {} from {}", ts, event.kind, event.sender),
  }
}

/// First `max` characters, single line
fn truncate(text: &str, max: usize) -> String {
  let flat: String = text.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
  if flat.chars().count() <= max {
    flat
  } else {
    let mut cut: String = flat.chars().take(max).collect();
    cut.push_str("...");
    cut
  }
}

pub fn format_events(events: &[Event]) -> String {
  if events.is_empty() {
    return "No events found".to_string();
  }

  let mut output = format!("Found {} events:\n\n", events.len());
  for event in events {
    output.push_str(&format_event(event));
    output.push('\n');
  }
  output
}

// ============================================================================
// Stats
// ============================================================================

pub fn format_stats(stats: &StoreStats) -> String {
  let mut output = String::new();
  output.push_str("mxindex Statistics\n");
  output.push_str("==================\n\n");
  output.push_str(&format!("Total events:   {}\n", stats.total_events));
  output.push_str(&format!("Messages:       {}\n", stats.message_events));
  output.push_str(&format!("Rooms:          {}\n", stats.unique_sources));
  output.push_str(&format!("Users:          {}\n", stats.unique_senders));

  if !stats.per_source.is_empty() {
    output.push_str("\n--- Per Room ---\n");
    let mut rooms: Vec<_> = stats.per_source.iter().collect();
    rooms.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (room, count) in rooms {
      output.push_str(&format!("{:>10}  {}\n", count, room));
    }
  }
  output
}

// ============================================================================
// Backfill
// ============================================================================

pub fn format_backfill(reports: &[BackfillReport]) -> String {
  if reports.is_empty() {
    return "Nothing to backfill".to_string();
  }

  let mut output = String::new();
  for r in reports {
    output.push_str(&format!(
      "{}: {} new, {} already stored, {} malformed, {} pages ({})\n",
      r.source_id, r.inserted, r.duplicates, r.malformed, r.pages, r.stop
    ));
  }
  let total: usize = reports.iter().map(|r| r.inserted).sum();
  output.push_str(&format!("\nBackfilled {} events across {} rooms\n", total, reports.len()));
  output
}

#[cfg(test)]
mod tests {
  use mxindex_core::EventOrigin;
  use pretty_assertions::assert_eq;
  use serde_json::json;

  use super::*;

  fn parse(raw: serde_json::Value) -> Event {
    Event::from_raw("!r:x", raw, EventOrigin::Live).unwrap()
  }

  #[test]
  fn test_message_line() {
    let event = parse(json!({
      "event_id": "$a",
      "type": "m.room.message",
      "sender": "@alice:x",
      "origin_server_ts": 1_700_000_000_000i64,
      "content": {"body": "hello\nworld"},
    }));
    assert_eq!(format_event(&event), "[2023-11-14 22:13:20] @alice:x: hello world");
  }

  #[test]
  fn test_long_body_is_cut() {
    let event = parse(json!({
      "event_id": "$a",
      "type": "m.room.message",
      "sender": "@alice:y",
      "origin_server_ts": 0,
      "content": {"body": "x".repeat(200)},
    }));
    let line = format_event(&event);
    assert!(line.ends_with("..."));
    assert_eq!(line.matches('x').count(), PREVIEW_CHARS);
  }

  #[test]
  fn test_non_message_line() {
    let event = parse(json!({
      "event_id": "$m",
      "type": "m.room.member",
      "sender": "@bob:x",
      "origin_server_ts": 0,
      "content": {"membership": "join"},
    }));
    assert_eq!(format_event(&event), "[1970-01-01 00:00:00] m.room.member from @bob:x");
  }

  #[test]
  fn test_stats_sorted_by_count() {
    let mut stats = StoreStats {
      total_events: 3,
      message_events: 3,
      unique_sources: 2,
      unique_senders: 1,
      ..Default::default()
    };
    stats.per_source.insert("!a:x".into(), 1);
    stats.per_source.insert("!b:x".into(), 2);

    let output = format_stats(&stats);
    let b = output.find("!b:x").unwrap();
    let a = output.find("!a:x").unwrap();
    assert!(b < a);
  }
}
