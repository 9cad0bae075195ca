//! Spool CLI
//!
//! Thin operator tool over spool-core: inspect, feed and drain a spool
//! database from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Buffer a payload
//! spool push clicks '{"button":"buy"}' --priority 2
//!
//! # Show record counts per kind
//! spool stats
//!
//! # Look at the next batch without delivering it
//! spool peek clicks --limit 5 --by-priority
//!
//! # Deliver everything of a kind to stdout, one JSON array per batch
//! spool drain clicks --batch-size 50
//!
//! # Keep only the newest 1000 records / drop everything
//! spool truncate 1000
//! spool clear
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spool_core::{Completion, OutputConfig, Predicate, Query, Sort, Spool, Storage};

/// Spool - durable local log buffering
#[derive(Parser)]
#[command(name = "spool")]
#[command(version)]
#[command(about = "Spool - durable local log buffering with batched delivery")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.spool/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Database namespace, e.g. the producing process name
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Buffer one payload
    Push {
        /// Log kind
        kind: String,
        /// Payload (stored verbatim)
        payload: String,
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },

    /// Show total and per-kind record counts
    Stats,

    /// Print the records the next flush of a kind would select
    Peek {
        kind: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Order by priority (highest first) instead of id
        #[arg(long)]
        by_priority: bool,
    },

    /// Deliver every record of a kind to stdout, one JSON array per batch
    Drain {
        kind: String,
        #[arg(short, long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long)]
        by_priority: bool,
        /// Purge records older than this before each batch
        #[arg(long)]
        purge_age_secs: Option<u64>,
    },

    /// Drop the oldest records so that at most MAX remain
    Truncate { max: usize },

    /// Delete every record
    Clear,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.spool/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spool")
        .join("data")
}

fn batch_sort(by_priority: bool) -> Vec<Sort> {
    if by_priority {
        vec![Sort::priority_desc(), Sort::id_asc()]
    } else {
        vec![Sort::id_asc()]
    }
}

/// Writes each batch to stdout as a JSON array of payloads
fn stdout_sink(payloads: Vec<String>, done: Completion) {
    match serde_json::to_string(&payloads) {
        Ok(line) => {
            println!("{}", line);
            done.success();
        }
        Err(e) => done.fail(e.to_string()),
    }
}

async fn drain(
    db_path: &Path,
    kind: String,
    batch_size: usize,
    by_priority: bool,
    purge_age_secs: Option<u64>,
) -> Result<usize> {
    let spool = Spool::open(db_path)?;

    let mut config = OutputConfig::default()
        .with_batch_size(batch_size)
        .with_sort(batch_sort(by_priority));
    if let Some(secs) = purge_age_secs {
        config = config.with_purge_age(Duration::from_secs(secs));
    }
    let output = spool.register(kind.as_str(), config, stdout_sink)?;

    let of_kind = [Predicate::of_type(kind.as_str())];
    let initial = spool.storage().count_matching(&of_kind)?;
    let mut remaining = initial;

    while remaining > 0 {
        output.flush();
        // One pass runs the cycle, the next its completion
        spool.sync().await?;
        spool.sync().await?;

        let left = spool.storage().count_matching(&of_kind)?;
        if left >= remaining {
            spool.shutdown().await;
            anyhow::bail!("Drain of '{}' stalled with {} records left", kind, left);
        }
        remaining = left;
    }

    spool.shutdown().await;
    Ok(initial)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let db_path = data_dir.join(Storage::file_name(cli.namespace.as_deref()));
    tracing::debug!(path = %db_path.display(), "Using spool database");

    match cli.command {
        Commands::Push {
            kind,
            payload,
            priority,
        } => {
            let storage = Storage::new(&db_path)?;
            let id = storage.insert_with_priority(&kind, &payload, priority)?;
            println!("Buffered {} ({})", id, kind);
        }

        Commands::Stats => {
            let storage = Storage::new(&db_path)?;
            println!("Database: {}", db_path.display());
            println!("Total: {}", storage.count()?);
            for (kind, count) in storage.kinds()? {
                println!("  {}: {}", kind, count);
            }
        }

        Commands::Peek {
            kind,
            limit,
            by_priority,
        } => {
            let storage = Storage::new(&db_path)?;
            let batch = storage.select(
                &Query::new()
                    .filter(Predicate::of_type(kind.as_str()))
                    .with_sort(batch_sort(by_priority))
                    .limit(limit),
            )?;

            if batch.is_empty() {
                println!("No records for '{}'", kind);
            }
            for record in &batch {
                println!("{}  p={}  {}", record.id, record.priority, record.payload);
            }
        }

        Commands::Drain {
            kind,
            batch_size,
            by_priority,
            purge_age_secs,
        } => {
            let handled = drain(&db_path, kind.clone(), batch_size, by_priority, purge_age_secs)
                .await
                .with_context(|| format!("Failed to drain '{}'", kind))?;
            eprintln!("Drained {} records of '{}'", handled, kind);
        }

        Commands::Truncate { max } => {
            let storage = Storage::new(&db_path)?;
            let dropped = storage.truncate(max)?;
            println!("Dropped {} records", dropped);
        }

        Commands::Clear => {
            let storage = Storage::new(&db_path)?;
            let cleared = storage.clear()?;
            println!("Cleared {} records", cleared);
        }
    }

    Ok(())
}
