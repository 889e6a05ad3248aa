//! ledgersync CLI
//!
//! Maintenance tools for a replica's message log.
//!
//! # Commands
//!
//! - `inspect` - Display message counts, clock and trie root
//! - `verify` - Check record checksums and rebuild the trie
//! - `dump-log` - Dump log records for debugging
//! - `diff` - Show time ranges where two logs disagree

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ledgersync command-line log tools.
#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the message log
    #[arg(global = true, short = 'L', long)]
    log: Option<PathBuf>,

    /// Path to the schema JSON file
    #[arg(global = true, short = 'S', long)]
    schema: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display message counts, clock and trie root
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check record checksums and rebuild the trie
    Verify {
        /// Treat an incomplete final record as a failure
        #[arg(long)]
        strict: bool,
    },

    /// Dump log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip records that start before this byte offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show time ranges where two logs hold different messages
    Diff {
        /// Log to compare against
        other: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let log = cli.log.ok_or("Log path required for inspect")?;
            let schema = cli.schema.ok_or("Schema path required for inspect")?;
            commands::inspect::run(&log, &schema, &format)?;
        }
        Commands::Verify { strict } => {
            let log = cli.log.ok_or("Log path required for verify")?;
            let schema = cli.schema.ok_or("Schema path required for verify")?;
            commands::verify::run(&log, &schema, strict)?;
        }
        Commands::DumpLog {
            limit,
            offset,
            format,
        } => {
            let log = cli.log.ok_or("Log path required for dump-log")?;
            let schema = cli.schema.ok_or("Schema path required for dump-log")?;
            commands::dump_log::run(&log, &schema, limit, offset, &format)?;
        }
        Commands::Diff { other, format } => {
            let log = cli.log.ok_or("Log path required for diff")?;
            let schema = cli.schema.ok_or("Schema path required for diff")?;
            commands::diff::run(&log, &other, &schema, &format)?;
        }
        Commands::Version => {
            println!("ledgersync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync protocol v{}", ledgersync_protocol::PROTOCOL_VERSION);
            println!("Log format v{}", ledgersync_crdt::log::LOG_VERSION);
        }
    }

    Ok(())
}
