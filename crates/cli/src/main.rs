//! mxindex CLI - Matrix event ingestion and search

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod format;
mod logging;

use commands::{
  SearchQuery, cmd_backfill, cmd_config_init, cmd_config_show, cmd_resync, cmd_run, cmd_search, cmd_stats, load_config,
};
use logging::{init_cli_logging, init_daemon_logging};
use mxindex::RuntimeConfig;
use mxindex_core::Config;

#[derive(Parser)]
#[command(name = "mxindex")]
#[command(about = "Ingest, deduplicate and search Matrix room events")]
#[command(after_help = "\
QUICK START:
  mxindex config init             # Write a config template
  mxindex run --foreground        # Stream and backfill, logging to the console
  mxindex search text \"deploy\"    # Search stored messages")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the ingestion daemon until interrupted
  Run {
    /// Log to the console instead of the log file
    #[arg(long)]
    foreground: bool,
    /// Keep events in memory only
    #[arg(long)]
    ephemeral: bool,
    /// Stream live events without walking history
    #[arg(long)]
    no_backfill: bool,
  },
  /// Backfill history for one room, or every joined room, then exit
  Backfill {
    /// Room id (default: every joined room)
    #[arg(long)]
    room: Option<String>,
    /// Maximum events per room for this run (0 = unlimited)
    #[arg(long)]
    limit: Option<usize>,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Search stored events
  Search {
    #[command(subcommand)]
    command: SearchCommand,
    /// Maximum results
    #[arg(short, long, default_value = "50", global = true)]
    limit: usize,
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
  },
  /// Show store statistics
  Stats {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Forget the stream token and cursors so the next run starts a fresh sync
  Resync,
  /// Configuration management
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

/// Subcommands for `mxindex search`
#[derive(Subcommand)]
enum SearchCommand {
  /// Events in a room
  Room { room: String },
  /// Events sent by a user
  User { user: String },
  /// Messages whose body contains any of the words
  Text { text: String },
  /// Events between two days (YYYY-MM-DD, inclusive)
  Date {
    start: String,
    /// Last day (default: same as start)
    end: Option<String>,
  },
  /// Events of one type, e.g. m.room.member
  Type { kind: String },
}

impl From<SearchCommand> for SearchQuery {
  fn from(cmd: SearchCommand) -> Self {
    match cmd {
      SearchCommand::Room { room } => SearchQuery::Room(room),
      SearchCommand::User { user } => SearchQuery::User(user),
      SearchCommand::Text { text } => SearchQuery::Text(text),
      SearchCommand::Date { start, end } => SearchQuery::Date { start, end },
      SearchCommand::Type { kind } => SearchQuery::Type(kind),
    }
  }
}

/// Subcommands for `mxindex config`
#[derive(Subcommand)]
enum ConfigCommand {
  /// Print the effective configuration with credentials masked
  Show,
  /// Write a config template to the user config path
  Init,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Run {
      foreground,
      ephemeral,
      no_backfill,
    } => {
      let mut runtime = RuntimeConfig::load()?;
      runtime.foreground = foreground;
      runtime.ephemeral = ephemeral;
      if no_backfill {
        runtime.config.backfill.enabled = false;
      }
      let _guard = init_daemon_logging(&runtime.config.log_level, foreground);
      cmd_run(runtime).await
    }
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(load_config()?),
      ConfigCommand::Init => cmd_config_init(),
    },
    Commands::Backfill { room, limit, json } => cmd_backfill(command_config()?, room, limit, json).await,
    Commands::Search { command, limit, json } => cmd_search(command_config()?, command.into(), limit, json).await,
    Commands::Stats { json } => cmd_stats(command_config()?, json).await,
    Commands::Resync => cmd_resync(command_config()?).await,
  }
}

/// Config for one-shot commands, with console logging set up from it
fn command_config() -> Result<Config> {
  let config = load_config()?;
  init_cli_logging(&config.log_level);
  Ok(config)
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn test_cli_definition_is_valid() {
    Cli::command().debug_assert();
  }

  #[test]
  fn test_search_limit_defaults_to_50() {
    let cli = Cli::try_parse_from(["mxindex", "search", "room", "!r:x"]).unwrap();
    match cli.command {
      Commands::Search { limit, json, command } => {
        assert_eq!(limit, 50);
        assert!(!json);
        assert!(matches!(command, SearchCommand::Room { room } if room == "!r:x"));
      }
      _ => panic!("expected search"),
    }
  }

  #[test]
  fn test_search_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["mxindex", "search", "text", "deploy", "--limit", "5", "--json"]).unwrap();
    match cli.command {
      Commands::Search { limit, json, .. } => {
        assert_eq!(limit, 5);
        assert!(json);
      }
      _ => panic!("expected search"),
    }
  }

  #[test]
  fn test_every_one_shot_command_parses() {
    let cli = Cli::try_parse_from(["mxindex", "stats", "--json"]).unwrap();
    assert!(matches!(cli.command, Commands::Stats { json: true }));

    let cli = Cli::try_parse_from(["mxindex", "resync"]).unwrap();
    assert!(matches!(cli.command, Commands::Resync));

    let cli = Cli::try_parse_from(["mxindex", "backfill", "--room", "!r:x", "--limit", "20"]).unwrap();
    match cli.command {
      Commands::Backfill { room, limit, json } => {
        assert_eq!(room.as_deref(), Some("!r:x"));
        assert_eq!(limit, Some(20));
        assert!(!json);
      }
      _ => panic!("expected backfill"),
    }

    let cli = Cli::try_parse_from(["mxindex", "run", "--foreground", "--ephemeral", "--no-backfill"]).unwrap();
    assert!(matches!(
      cli.command,
      Commands::Run {
        foreground: true,
        ephemeral: true,
        no_backfill: true
      }
    ));

    let cli = Cli::try_parse_from(["mxindex", "config", "show"]).unwrap();
    assert!(matches!(cli.command, Commands::Config { command: ConfigCommand::Show }));
  }
}
