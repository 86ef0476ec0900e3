use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// ledger: inspect replicas of a budget database.
///
/// Reads the message log, clock record and rows of a SQLite replica.
#[derive(Parser)]
#[command(name = "ledger", version, about, long_about = None)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the clock, trie summary and row counts.
    Status {
        /// Path to the SQLite replica.
        db: String,
    },

    /// List logged change messages.
    Messages {
        /// Path to the SQLite replica.
        db: String,

        /// Only messages after this timestamp.
        #[arg(long)]
        since: Option<String>,

        /// Limit the number of messages shown.
        #[arg(long, default_value = "20")]
        last: usize,

        /// Print messages as JSON lines in wire form.
        #[arg(long)]
        json: bool,
    },

    /// Check the persisted trie against the message log.
    Verify {
        /// Path to the SQLite replica.
        db: String,

        /// Rebuild and persist the trie when it does not match.
        #[arg(long)]
        repair: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = commands::load_config(cli.config.as_deref()).and_then(|config| {
        match cli.command {
            Commands::Status { db } => commands::status(&db, &config),
            Commands::Messages {
                db,
                since,
                last,
                json,
            } => commands::messages(&db, since.as_deref(), last, json),
            Commands::Verify { db, repair } => commands::verify(&db, config, repair),
        }
    });

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
