//! CalMirror CLI
//!
//! Command-line interface for CalMirror - keeps a local mirror of calendar
//! events and reminders and queries it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use calmirror_core::Config;

mod commands;
mod logging;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "calmirror")]
#[command(about = "CalMirror - local mirror of calendars, events and reminders")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the mirror once from an export file
    Sync {
        /// Exported calendar data (JSON)
        #[arg(short, long)]
        source: PathBuf,
    },
    /// Keep the mirror in sync with an export file until interrupted
    Watch {
        /// Exported calendar data (JSON)
        #[arg(short, long)]
        source: PathBuf,
        /// Seconds between checks of the file for changes
        #[arg(long, default_value_t = 2)]
        poll: u64,
    },
    /// List mirrored calendars
    Calendars,
    /// List mirrored events
    Events {
        /// First day (YYYY-MM-DD), defaults to today
        #[arg(long)]
        from: Option<String>,
        /// Last day (YYYY-MM-DD), defaults to a week after --from
        #[arg(long)]
        to: Option<String>,
        /// Only events of this calendar
        #[arg(short, long)]
        calendar: Option<String>,
    },
    /// List mirrored reminders
    Reminders {
        /// Only completed reminders
        #[arg(long, conflicts_with = "open")]
        completed: bool,
        /// Only open reminders
        #[arg(long)]
        open: bool,
    },
    /// Search events (or reminders)
    Search {
        /// Search query
        query: String,
        /// Search reminders instead of events
        #[arg(short, long)]
        reminders: bool,
    },
    /// Show mirror status
    Status,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, periodic_interval_secs, calendars, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Config commands work on the file itself, even when it is invalid
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), config_path, &output);
    }

    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    logging::init(&config);

    match cli.command {
        Commands::Sync { source } => commands::sync::sync(&config, source, &output).await,
        Commands::Watch { source, poll } => {
            commands::watch::watch(&config, source, poll, &output).await
        }
        Commands::Calendars => commands::query::calendars(&config, &output),
        Commands::Events { from, to, calendar } => {
            commands::query::events(&config, from, to, calendar, &output)
        }
        Commands::Reminders { completed, open } => {
            commands::query::reminders(&config, completed, open, &output)
        }
        Commands::Search { query, reminders } => {
            commands::query::search(&config, query, reminders, &output)
        }
        Commands::Status => commands::status::show(&config, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}
