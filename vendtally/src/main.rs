//! vendtally - anonymous dispense counter
//!
//! Records dispense events for one machine, keeps the lifetime total in a
//! local state database and forwards windowed aggregates to the configured
//! collector.
//!
//! Uses XDG Base Directory specification for file locations:
//! - State: $XDG_DATA_HOME/vendtally/state.db (~/.local/share/vendtally/state.db)
//! - Logs: $XDG_STATE_HOME/vendtally/vendtally.log (~/.local/state/vendtally/vendtally.log)
//! - Config: $XDG_CONFIG_HOME/vendtally/config.toml (~/.config/vendtally/config.toml)

mod process_lock;

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use process_lock::acquire_counter_guard;
use vendtally_core::sink::SinkStats;
use vendtally_core::{
    BlobStore, CategoryId, Config, Counter, CounterConfig, CounterStats, HttpSink, NetworkSink,
    NullSink, PersistedState, SqliteBlobStore, SyncDriver, SyncOutcome, SyncRequest, SystemClock,
    Timestamp,
};

#[derive(Parser)]
#[command(name = "vendtally")]
#[command(about = "Anonymous dispense counter for vending machines")]
#[command(version)]
struct Args {
    /// Verbose output (-v prints every recorded event)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Override the configured machine id
    #[arg(long, global = true)]
    machine_id: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count category ids read from stdin, one per line, until EOF or Ctrl+C
    Run {
        /// Sync driver poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll: u64,
    },
    /// Record the given category ids, then shut down
    Record {
        /// Category ids (1-255)
        #[arg(required = true)]
        categories: Vec<CategoryId>,
    },
    /// Attempt a sync of the open window and shut down
    Sync,
    /// Show the persisted counter state
    Status {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
}

/// Sink selected from configuration
enum CliSink {
    Http(HttpSink),
    Null(NullSink),
}

impl CliSink {
    fn from_config(config: &Config) -> Result<Self> {
        if config.counter.enable_external_api {
            let sink = HttpSink::new(&config.sink).context("failed to create HTTP sink")?;
            tracing::info!(
                endpoint = %config.counter.api_endpoint,
                "External API sink enabled"
            );
            Ok(Self::Http(sink))
        } else {
            Ok(Self::Null(NullSink))
        }
    }

    fn stats(&self) -> Option<&SinkStats> {
        match self {
            Self::Http(sink) => Some(sink.stats()),
            Self::Null(_) => None,
        }
    }
}

impl NetworkSink for CliSink {
    fn send(&mut self, request: &SyncRequest<'_>) -> vendtally_core::Result<()> {
        match self {
            Self::Http(sink) => sink.send(request),
            Self::Null(sink) => sink.send(request),
        }
    }
}

type CliCounter = Counter<SystemClock, SqliteBlobStore, CliSink>;

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(machine_id) = args.machine_id {
        config.counter.machine_id = machine_id;
    }

    let _log_guard =
        vendtally_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("vendtally starting");

    match args.command {
        Command::Run { poll } => run_counter(&config, Duration::from_millis(poll), args.verbose),
        Command::Record { ref categories } => record_batch(&config, categories, args.verbose),
        Command::Sync => run_sync(&config),
        Command::Status { json } => show_status(json),
        Command::Config => show_config(&config),
    }
}

/// Open the state database and initialize a counter over it
fn open_counter(config: &Config) -> Result<CliCounter> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening state database");

    let store = SqliteBlobStore::open(&db_path).context("failed to open state database")?;
    let sink = CliSink::from_config(config)?;

    let mut counter = Counter::new(SystemClock, store, sink);
    counter
        .init(Some(config.counter.clone()))
        .context("failed to initialize counter")?;
    counter.on_boot();
    Ok(counter)
}

/// Shut the counter down; `final_sync` is false when this run just synced
fn shutdown(counter: &mut CliCounter, final_sync: bool) -> Result<()> {
    counter.on_shutdown();
    let stats = counter.get_stats().context("counter was not running")?;
    counter
        .close(final_sync)
        .context("failed to shut down counter")?;

    let sink = counter
        .sink()
        .lock()
        .map_err(|_| anyhow::anyhow!("sink lock poisoned"))?;
    if let Some(sink_stats) = sink.stats() {
        if sink_stats.api_calls > 0 {
            tracing::info!(
                payloads_sent = sink_stats.payloads_sent,
                api_calls = sink_stats.api_calls,
                api_failures = sink_stats.api_failures,
                "Sink stats"
            );
        }
    }

    print_stats(&stats);
    Ok(())
}

/// Continuous counting from stdin with a background sync driver
fn run_counter(config: &Config, poll: Duration, verbose: u8) -> Result<()> {
    let _guard = acquire_counter_guard(&Config::database_path())
        .context("failed to acquire counter lock")?;

    let machine_id = config.counter.machine_id;
    let counter = Arc::new(Mutex::new(open_counter(config)?));
    let driver = SyncDriver::spawn(counter.clone(), poll).context("failed to start sync driver")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    // Stdin is read on its own thread so Ctrl+C is noticed while it blocks
    let (tx, rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("vendtally-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to start stdin reader")?;

    println!(
        "Counting for machine {} (sync poll every {}ms). Press Ctrl+C to stop.",
        machine_id,
        poll.as_millis()
    );

    let mut accepted = 0u64;
    let mut rejected = 0u64;

    while running.load(Ordering::SeqCst) {
        let line = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let Some(category) = parse_line(&line) else {
            continue;
        };

        let result = match category {
            Ok(category) => {
                let mut counter = counter
                    .lock()
                    .map_err(|_| anyhow::anyhow!("counter lock poisoned"))?;
                counter.record_event(machine_id, category)
            }
            Err(e) => {
                eprintln!("Skipping {:?}: {}", line.trim(), e);
                rejected += 1;
                continue;
            }
        };

        match result {
            Ok(()) => {
                accepted += 1;
                if verbose >= 1 {
                    let timestamp = chrono::Local::now().format("%H:%M:%S");
                    println!("[{}] category {}", timestamp, line.trim());
                }
            }
            Err(e) => {
                eprintln!("Rejected {:?}: {}", line.trim(), e);
                rejected += 1;
            }
        }
    }

    driver.stop();

    println!("Recorded {} event(s), rejected {}", accepted, rejected);
    tracing::info!(accepted, rejected, "vendtally run stopped");

    let mut counter = counter
        .lock()
        .map_err(|_| anyhow::anyhow!("counter lock poisoned"))?;
    shutdown(&mut counter, true)
}

/// Parse one stdin line; `None` for blank lines and comments
fn parse_line(line: &str) -> Option<std::result::Result<CategoryId, std::num::ParseIntError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.parse::<CategoryId>())
}

fn record_batch(config: &Config, categories: &[CategoryId], verbose: u8) -> Result<()> {
    let _guard = acquire_counter_guard(&Config::database_path())
        .context("failed to acquire counter lock")?;
    let mut counter = open_counter(config)?;

    let machine_id = config.counter.machine_id;
    let mut rejected = 0usize;
    for &category in categories {
        match counter.record_event(machine_id, category) {
            Ok(()) => {
                if verbose >= 1 {
                    println!("Recorded category {}", category);
                }
            }
            Err(e) => {
                eprintln!("Rejected category {}: {}", category, e);
                rejected += 1;
            }
        }
    }

    // Sync now rather than waiting for a driver that is not running; the
    // attempt replaces the final sync on shutdown
    let attempted = counter.get_stats()?.sync_pending;
    if attempted {
        report_sync(counter.poll());
    }

    shutdown(&mut counter, !attempted)?;

    if rejected > 0 {
        anyhow::bail!("{} of {} categories rejected", rejected, categories.len());
    }
    Ok(())
}

fn run_sync(config: &Config) -> Result<()> {
    let _guard = acquire_counter_guard(&Config::database_path())
        .context("failed to acquire counter lock")?;
    let mut counter = open_counter(config)?;

    report_sync(counter.force_sync());
    shutdown(&mut counter, false)
}

fn report_sync(result: vendtally_core::Result<SyncOutcome>) {
    match result {
        Ok(SyncOutcome::Sent(report)) => println!(
            "Synced {} event(s) for {} .. {}",
            report.total_events,
            format_timestamp(report.period_start),
            format_timestamp(report.period_end)
        ),
        Ok(SyncOutcome::Disabled) => println!("External API is disabled; nothing sent"),
        Ok(SyncOutcome::NotDue) => println!("Aggregation window is not due yet"),
        Ok(SyncOutcome::NothingToSend) => println!("No buffered events in the open window"),
        Ok(SyncOutcome::Idle) => {}
        Err(e) => {
            eprintln!("Sync failed: {}", e);
            tracing::warn!(error = %e, retryable = e.is_retryable(), "Sync failed");
        }
    }
}

fn show_status(json: bool) -> Result<()> {
    let db_path = Config::database_path();
    if !db_path.exists() {
        println!("No counter state at {}", db_path.display());
        return Ok(());
    }

    let mut store = SqliteBlobStore::open(&db_path).context("failed to open state database")?;
    let Some(blob) = store.read().context("failed to read counter state")? else {
        println!("No counter state at {}", db_path.display());
        return Ok(());
    };
    let state = PersistedState::decode(&blob).context("counter state is unreadable")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("State database: {}", db_path.display());
    if let Some(updated_at) = store.updated_at()? {
        println!("  Last written:     {}", updated_at.to_rfc3339());
    }
    println!("  Machine id:       {}", state.config.machine_id);
    println!("  Lifetime events:  {}", state.total_events);
    println!("  Window start:     {}", format_timestamp(state.last_aggregation));
    println!("  Last sync:        {}", format_timestamp(state.last_sync));
    println!(
        "  External API:     {}",
        if state.config.enable_external_api {
            "enabled"
        } else {
            "disabled"
        }
    );
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let counter = CounterConfig {
        api_key: if config.counter.api_key.is_empty() {
            String::new()
        } else {
            "********".to_string()
        },
        ..config.counter.clone()
    };

    println!("Config file:    {}", Config::config_path().display());
    println!("State database: {}", Config::database_path().display());
    println!("Log files:      {}.<date>", Config::log_path().display());
    println!("{}", serde_json::to_string_pretty(&counter)?);

    if let Err(e) = config.counter.validate() {
        println!("Warning: {}", e);
    }
    Ok(())
}

fn print_stats(stats: &CounterStats) {
    println!("Counter stats:");
    println!("  Lifetime events: {}", stats.total_events);
    println!("  Buffered events: {}", stats.buffered_events);
    println!("  Window start:    {}", format_timestamp(stats.window_start));
    println!("  Last sync:       {}", format_timestamp(stats.last_sync));
}

fn format_timestamp(ts: Timestamp) -> String {
    if ts == 0 {
        return "never".to_string();
    }
    i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("  7 \n"), Some(Ok(7)));
        assert!(parse_line("").is_none());
        assert!(parse_line("# restock").is_none());
        assert!(matches!(parse_line("256"), Some(Err(_))));
        assert!(matches!(parse_line("cola"), Some(Err(_))));
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "never");
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14T22:13:20+00:00");
    }
}
