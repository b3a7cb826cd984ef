//! Command surface for the callwatch engine.
//!
//! Hosts embed through [`run_cli`] for parsed arguments, [`run_with_db`] for a
//! single command against a DB path, or [`run_command`] against an open
//! [`SqliteCallStore`].

#![allow(clippy::missing_errors_doc)]

pub mod config;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use callwatch_core::{
    format_rfc3339, now_utc, parse_feed_timestamp, CallRecord, HistoryOptions,
};
use callwatch_poller::{HttpSnapshotSource, Poller, PollerConfig};
use callwatch_store_sqlite::{SqliteCallStore, StatusCount};
use clap::{Args, Parser, Subcommand};
use time::macros::{format_description, time};
use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::config::{interval_from_secs, timeout_from_ms, Settings};

#[derive(Debug, Parser)]
#[command(name = "cw")]
#[command(about = "Callwatch emergency call history CLI")]
pub struct Cli {
    /// `SQLite` file holding the call history.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll the live feed and reconcile every snapshot into the store.
    Poll(PollArgs),
    /// Reconcile one snapshot read from a JSON file.
    Ingest(IngestArgs),
    /// Query closed incidents.
    History(HistoryArgs),
    /// Print the stored record of one incident.
    Show(ShowArgs),
    /// Count stored records by status.
    Stats(StatsArgs),
}

#[derive(Debug, Args)]
pub struct PollArgs {
    #[arg(long)]
    feed_url: Option<String>,
    #[arg(long)]
    interval_secs: Option<u64>,
    /// `0` disables the fetch timeout.
    #[arg(long)]
    fetch_timeout_ms: Option<u64>,
    /// Stop after this many cycles instead of running until Ctrl-C.
    #[arg(long)]
    cycles: Option<u32>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    snapshot: PathBuf,
    /// Clock used for synthesized closures; defaults to now.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// Inclusive lower bound on creation time (RFC3339 or YYYY-MM-DD).
    #[arg(long)]
    start: Option<String>,
    /// Inclusive upper bound on creation time (RFC3339 or YYYY-MM-DD).
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    entity_id: i64,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeEdge {
    Start,
    End,
}

/// Executes the parsed top-level CLI command graph.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(cli.config.as_deref(), cli.db)?;
    match cli.command {
        Command::Poll(args) => run_poll(args, settings),
        command => {
            let mut store = open_store(&settings)?;
            run_command(command, &mut store)
        }
    }
}

/// Executes one command against the `SQLite` file at `db_path` with default
/// settings otherwise.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let settings = Settings {
        db_path: db_path.to_path_buf(),
        ..Settings::default()
    };
    match command {
        Command::Poll(args) => run_poll(args, settings),
        command => {
            let mut store = open_store(&settings)?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a store-only command against an existing handle.
pub fn run_command(command: Command, store: &mut SqliteCallStore) -> Result<()> {
    match command {
        Command::Ingest(args) => {
            let raw = fs::read_to_string(&args.snapshot)
                .with_context(|| format!("failed to read snapshot {}", args.snapshot.display()))?;
            let snapshot: Vec<CallRecord> = serde_json::from_str(&raw).with_context(|| {
                format!(
                    "snapshot {} is not a valid call feed payload",
                    args.snapshot.display()
                )
            })?;
            let now = match args.now.as_deref() {
                Some(value) => parse_feed_timestamp(value)
                    .map_err(|err| anyhow!("invalid --now value: {err}"))?,
                None => now_utc(),
            };

            let report = store.reconcile_at(&snapshot, now)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::History(args) => {
            let options = HistoryOptions {
                start_date: parse_range_edge(args.start.as_deref(), RangeEdge::Start)?,
                end_date: parse_range_edge(args.end.as_deref(), RangeEdge::End)?,
                search_text: args.search,
                limit: args.limit,
            };
            // The engine answers an inverted range with no rows; at the prompt
            // it is almost always a typo.
            options.validate()?;
            let rows = store.query_history(&options)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_history_table(&rows)?;
            }
            Ok(())
        }
        Command::Show(args) => {
            let Some(record) = store.find_by_entity_id(args.entity_id)? else {
                return Err(anyhow!("no stored call for entity_id {}", args.entity_id));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Stats(args) => {
            let counts = store.status_counts()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                print_status_counts(&counts);
            }
            Ok(())
        }
        Command::Poll(_) => Err(anyhow!(
            "internal dispatch error: poll should be handled before store initialization"
        )),
    }
}

fn run_poll(args: PollArgs, mut settings: Settings) -> Result<()> {
    let cycles = args.cycles;
    if let Some(url) = args.feed_url {
        settings.feed_url = url;
    }
    if let Some(secs) = args.interval_secs {
        settings.interval = interval_from_secs(secs)?;
    }
    if let Some(ms) = args.fetch_timeout_ms {
        settings.fetch_timeout = timeout_from_ms(ms);
    }

    let store = open_store(&settings)?;
    let source = HttpSnapshotSource::new(settings.feed_url.clone())?;
    let config = PollerConfig {
        interval: settings.interval,
        fetch_timeout: settings.fetch_timeout,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let poller = Poller::new(source, store, config);
        info!(
            feed_url = %settings.feed_url,
            db = %settings.db_path.display(),
            "polling call feed"
        );

        match cycles {
            Some(cycles) => {
                let mut failures = 0_u32;
                for cycle in 0..cycles {
                    if cycle > 0 {
                        tokio::time::sleep(config.interval).await;
                    }
                    match poller.poll_once().await {
                        Ok(report) => println!("{}", serde_json::to_string(&report)?),
                        Err(err) => {
                            failures += 1;
                            warn!(cycle, error = %err, "poll cycle failed");
                        }
                    }
                }
                if cycles > 0 && failures == cycles {
                    return Err(anyhow!("all {cycles} poll cycles failed"));
                }
            }
            None => {
                let handle = poller.start();
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for shutdown signal")?;
                info!("shutdown requested, waiting for in-flight cycle");
                handle.shutdown().await;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn open_store(settings: &Settings) -> Result<SqliteCallStore> {
    let store = SqliteCallStore::open(&settings.db_path)
        .with_context(|| format!("failed to open call store {}", settings.db_path.display()))?
        .with_reopen_policy(settings.reopen_policy);
    store.migrate()?;
    Ok(store)
}

fn parse_range_edge(raw: Option<&str>, edge: RangeEdge) -> Result<Option<OffsetDateTime>> {
    let Some(value) = raw.map(str::trim) else {
        return Ok(None);
    };

    if let Ok(date) = Date::parse(value, format_description!("[year]-[month]-[day]")) {
        let at = match edge {
            RangeEdge::Start => date.midnight(),
            RangeEdge::End => date.with_time(time!(23:59:59.999999999)),
        };
        return Ok(Some(at.assume_utc()));
    }

    parse_feed_timestamp(value)
        .map(Some)
        .map_err(|err| anyhow!("invalid range bound {value:?}: {err}"))
}

fn print_history_table(rows: &[CallRecord]) -> Result<()> {
    println!(
        "{:<12} {:<14} {:<22} {:<28} {:<10} location",
        "entity_id", "sequence", "created", "type", "agency"
    );
    println!("{}", "-".repeat(110));

    for record in rows {
        println!(
            "{:<12} {:<14} {:<22} {:<28} {:<10} {}",
            record.entity_id,
            record.sequence_number,
            format_rfc3339(record.creation_timestamp)?,
            record.type_description,
            record.agency_type,
            record.location
        );
    }
    println!("{} closed call(s)", rows.len());
    Ok(())
}

fn print_status_counts(counts: &[StatusCount]) {
    let total: usize = counts.iter().map(|entry| entry.count).sum();
    for entry in counts {
        println!("{:<16} {}", entry.status, entry.count);
    }
    println!("{:<16} {total}", "total");
}
