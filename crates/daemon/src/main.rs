//! RosterSync daemon entry point.
//!
//! Loads configuration, connects both stores, runs reconciliation sweeps on
//! the configured interval, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use rostersync_core::config::AppConfig;
use rostersync_core::db::Database;
use rostersync_core::stores::build_connection;
use rostersync_core::{RunStatus, SyncEngine};

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// RosterSync reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "rostersync-daemon",
    version,
    about = "Periodic member roster reconciliation daemon"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber: stderr always, plus a daily-rotated file
/// under `log_dir` when configured. The returned guard flushes the file
/// writer on drop.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rostersync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let _log_guard = init_tracing(log_level, config.daemon.log_dir.as_deref());

    // Startup banner
    info!("========================================");
    info!("  RosterSync Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Store A       : {} ({})", config.store_a.name(), config.store_a.kind());
    info!("Store B       : {} ({})", config.store_b.name(), config.store_b.kind());
    info!("Pivot fields  : {}", config.reconcile.pivot_fields.join(", "));
    for pivot in &config.reconcile.fallback_pivots {
        info!("  fallback    : {}", pivot.join(", "));
    }
    info!(
        "Synced fields : {}",
        config.shared_fields().into_iter().collect::<Vec<_>>().join(", ")
    );
    info!("Direction     : {}", config.reconcile.direction);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");
    if config.reconcile.dry_run {
        warn!("dry_run is enabled: sweeps will report planned writes only");
    }

    let conn_a =
        build_connection(&config.store_a, &config.schema).context("failed to set up store A")?;
    let conn_b =
        build_connection(&config.store_b, &config.schema).context("failed to set up store B")?;

    let db = Database::open_initialized(config.db_path())
        .context("failed to open run-history database")?;
    info!("Database initialized at {}", config.db_path().display());

    let sched = Arc::new(scheduler::Scheduler::new(
        SyncEngine::new(config.reconcile_settings()),
        conn_a,
        conn_b,
        db,
        Duration::from_secs(config.daemon.poll_interval_secs),
        config.daemon.history_keep,
    ));

    if args.once {
        if let Some(summary) = sched.sweep("once").await {
            info!("{}", summary);
            if summary.status == RunStatus::Failed {
                anyhow::bail!("sweep {} failed", summary.run_id);
            }
        }
        return Ok(());
    }

    // Create a shutdown notify for cooperative cancellation
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let scheduler_handle = {
        let sched = sched.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sched.run(shutdown).await })
    };

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");
    shutdown.notify_waiters();

    // Let an in-flight sweep finish (up to 30s)
    match tokio::time::timeout(Duration::from_secs(30), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 30s, forcing shutdown"),
    }

    let stats = sched.stats();
    info!(
        sweeps = stats.total_sweeps.load(Ordering::SeqCst),
        failed = stats.failed_sweeps.load(Ordering::SeqCst),
        writes = stats.total_writes.load(Ordering::SeqCst),
        conflicts = stats.total_conflicts.load(Ordering::SeqCst),
        "sweep totals"
    );
    info!("RosterSync daemon stopped.");
    Ok(())
}
