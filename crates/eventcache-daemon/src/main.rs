//! eventcache - background refresher for the listing cache.
//!
//! Keeps every configured (region, category) pair warm in the tiered cache
//! so that serving instances sharing the disk directory or the remote store
//! answer from cache.
//!
//! Usage:
//!   eventcache            run the scheduler until Ctrl-C
//!   eventcache --once     run one refresh cycle and print its summary
//!   eventcache --stats    print per-tier cache statistics
//!   eventcache --sweep    evict expired entries and print the report

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eventcache_core::{
    Config, HttpListingSource, HttpRemoteStore, Orchestrator, RemoteStore, Scheduler,
    SchedulerConfig, TieredStore,
};

// ============================================================================
// Constants
// ============================================================================

/// How long shutdown waits for in-flight refreshes and remote writes
const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Log file name prefix inside `{cache_dir}/logs`
const LOG_FILE_PREFIX: &str = "eventcache.log";

enum Command {
    Run,
    Once,
    Stats,
    Sweep,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args.get(1).map(String::as_str) {
            None => Ok(Command::Run),
            Some("--once") => Ok(Command::Once),
            Some("--stats") => Ok(Command::Stats),
            Some("--sweep") => Ok(Command::Sweep),
            Some(other) => anyhow::bail!(
                "Unknown argument: {} (expected --once, --stats or --sweep)",
                other
            ),
        }
    }
}

/// Initialize the tracing subscriber: stderr plus a daily log file.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();

    guard
}

fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let cache_dir = config.cache_dir()?;
    let mut builder = TieredStore::builder(config.ttl()).disk(&cache_dir);
    if let Some(ref remote) = config.remote {
        let store = HttpRemoteStore::new(remote, config.fetch_timeout())
            .context("Failed to create remote store client")?;
        builder = builder.remote(Arc::new(store) as Arc<dyn RemoteStore>);
    }
    let store = builder
        .build()
        .with_context(|| format!("Failed to open cache directory: {}", cache_dir.display()))?;

    let source = HttpListingSource::new(&config.source, config.fetch_timeout())
        .context("Failed to create listing source client")?;

    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(source),
        config.fetch_timeout(),
        config.max_concurrent_refreshes,
    );
    Ok(Scheduler::new(orchestrator, SchedulerConfig::from_config(config)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let command = Command::parse(&args)?;

    let config = Config::load().context("Failed to load configuration")?;
    let log_dir = config.cache_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let _log_guard = init_tracing(&log_dir);

    let scheduler = Arc::new(build_scheduler(&config)?);
    let orchestrator = scheduler.orchestrator().clone();
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);

    match command {
        Command::Once => {
            let summary = scheduler.run_once().await;
            orchestrator.shutdown(grace).await;
            print_json(&summary)?;
        }
        Command::Stats => {
            print_json(&orchestrator.store().stats().await)?;
        }
        Command::Sweep => {
            print_json(&orchestrator.store().sweep().await)?;
        }
        Command::Run => {
            info!(
                regions = config.source.regions.len(),
                categories = config.source.categories.len(),
                "eventcache starting"
            );
            let handle = Arc::clone(&scheduler).start();

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");

            handle.stop().await;
            if !orchestrator.shutdown(grace).await {
                info!("Some background work was abandoned at shutdown");
            }
            info!("eventcache stopped");
        }
    }

    Ok(())
}
