//! requestkeeper CLI - schema migrations and store diagnostics

mod commands;

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "requestkeeper")]
#[command(version)]
#[command(about = "Persistence toolkit for the content-request bot - pooled SQLite store and versioned migrations")]
#[command(long_about = r#"
requestkeeper owns the bot's SQLite store:
  • Versioned schema migrations with a ledger (upgrade / rollback)
  • Schema validation against the expected tables and indexes
  • Connection pool health and gateway statistics

Example usage:
  requestkeeper setup
  requestkeeper upgrade 005
  requestkeeper rollback 003 --database data/bot.db
  requestkeeper status --json
"#)]
struct Cli {
    /// Path to the TOML config file (defaults to ./requestkeeper.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file, overriding config and DB_PATH
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a fresh or existing store to the latest schema and validate it
    Setup,

    /// Apply pending migrations up to an optional target version
    Upgrade {
        /// Highest version to apply (e.g. 005); all pending when omitted
        target: Option<String>,
    },

    /// Revert applied migrations above the target version
    Rollback {
        /// Version to roll back to; it stays applied
        target: String,
    },

    /// Show the current version and per-migration details
    Status,

    /// Check tables, important indexes and ledger checksums
    Validate,

    /// Check pool liveness and show pool statistics
    Health,

    /// Show aggregate request, user and rating statistics
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn is_human(self) -> bool {
        self == OutputMode::Human
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    ok: bool,
    command: &'a str,
    data: T,
}

/// Print the JSON envelope for a command. No-op in human mode.
pub fn emit_success<T: Serialize>(mode: OutputMode, command: &str, data: T) -> anyhow::Result<()> {
    emit(mode, true, command, data)
}

pub fn emit_failure<T: Serialize>(mode: OutputMode, command: &str, data: T) -> anyhow::Result<()> {
    emit(mode, false, command, data)
}

fn emit<T: Serialize>(mode: OutputMode, ok: bool, command: &str, data: T) -> anyhow::Result<()> {
    if mode.is_human() {
        return Ok(());
    }
    let envelope = Envelope { ok, command, data };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let ctx = commands::Context::open(cli.config.as_deref(), cli.database, output_mode)?;

    match cli.command {
        Commands::Setup => commands::run_setup(&ctx),
        Commands::Upgrade { target } => commands::run_upgrade(&ctx, target.as_deref()),
        Commands::Rollback { target } => commands::run_rollback(&ctx, &target),
        Commands::Status => commands::run_status(&ctx),
        Commands::Validate => commands::run_validate(&ctx),
        Commands::Health => commands::run_health(&ctx),
        Commands::Stats => commands::run_stats(&ctx),
    }
}
