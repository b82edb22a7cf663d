//! RosterSync command-line tool.
//!
//! Provides subcommands for generating and validating configuration,
//! running a one-off reconciliation between the two configured stores, and
//! inspecting the run history.

mod report;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rostersync_core::config::{AppConfig, SAMPLE_CONFIG};
use rostersync_core::db::Database;
use rostersync_core::record::Side;
use rostersync_core::stores::build_connection;
use rostersync_core::{RunStatus, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// RosterSync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "rostersync",
    version,
    about = "Reconcile member records between two stores"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/rostersync/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a starter configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./rostersync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Run one reconciliation between the configured stores.
    Sync {
        /// Compute and report the writes without applying them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the summary of the most recent run.
    Report,

    /// List recent runs.
    History {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show the full summary of one run.
    Show {
        /// Run id, or a unique prefix of it.
        id: String,
    },

    /// Delete all but the most recent runs from the history.
    Prune {
        /// Number of runs to keep (at least 1).
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        keep: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli.config))
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Sync { dry_run } => cmd_sync(&cli.config, dry_run).await,
        Commands::Report => cmd_report(&open_database(&cli.config)?),
        Commands::History { limit } => cmd_history(&open_database(&cli.config)?, limit),
        Commands::Show { id } => cmd_show(&open_database(&cli.config)?, &id),
        Commands::Prune { keep } => cmd_prune(&open_database(&cli.config)?, keep),
    }
}

/// `RUST_LOG` when set, else the configured `daemon.log_level`, else `warn`.
fn log_filter(config_path: &Path) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    configured_level(config_path)
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

/// The log level from the config file, if it loads.
fn configured_level(config_path: &Path) -> Option<String> {
    AppConfig::load_from_file(config_path)
        .ok()
        .map(|config| config.daemon.log_level)
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration")
}

fn open_database(config_path: &Path) -> Result<Database> {
    let config = AppConfig::load_from_file(config_path).context("failed to load configuration")?;
    Database::open_initialized(config.db_path()).context("failed to open run-history database")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, SAMPLE_CONFIG).context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Fill in the Airtable base id and table, and adjust the field map");
    println!("  2. Export the token variables (ACTION_NETWORK_TOKEN, AIRTABLE_TOKEN)");
    println!("  3. Validate with: rostersync validate --config {}", output.display());
    println!("  4. Preview a run: rostersync sync --dry-run --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  {}", style::success("Environment variable references processed"));

    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("Schema, reconcile rules and stores are consistent"));

    let reconcile = &config.reconcile;
    println!();
    println!("{}", style::header("Configuration summary"));
    for side in [Side::A, Side::B] {
        let store = config.store(side);
        let token = if store.token().is_some() {
            "set".to_string()
        } else {
            style::warn(&format!("NOT SET (${})", store.token_env()))
        };
        println!(
            "  Store {}       : {} ({}), token {}",
            side,
            store.name(),
            store.kind(),
            token
        );
    }
    println!("  Fields        : {}", config.schema.field_names().collect::<Vec<_>>().join(", "));
    println!("  Pivot fields  : {}", reconcile.pivot_fields.join(", "));
    for pivot in &reconcile.fallback_pivots {
        println!("    fallback    : {}", pivot.join(", "));
    }
    let shared = config.shared_fields();
    println!(
        "  Synced fields : {}",
        shared.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    );
    let unsynced: Vec<&str> = config
        .schema
        .field_names()
        .filter(|f| !shared.contains(*f))
        .collect();
    if !unsynced.is_empty() {
        println!(
            "  {}",
            style::warn(&format!("Not mapped by both stores: {}", unsynced.join(", ")))
        );
    }
    println!("  Default rule  : {}", reconcile.default_rule);
    for (field, rule) in &reconcile.rules {
        println!("    {:<12}: {}", field, rule);
    }
    println!("  Direction     : {}", reconcile.direction);
    println!("  Create missing: {}", reconcile.create_missing);
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Database      : {}", config.db_path().display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_sync(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;

    let conn_a = build_connection(&config.store_a, &config.schema)
        .context("failed to set up store A")?;
    let conn_b = build_connection(&config.store_b, &config.schema)
        .context("failed to set up store B")?;

    let mut settings = config.reconcile_settings();
    settings.dry_run |= dry_run;
    let engine = SyncEngine::new(settings);

    info!(store_a = conn_a.name(), store_b = conn_b.name(), "starting reconciliation");
    let summary = engine.run(conn_a.as_ref(), conn_b.as_ref()).await;

    let db = Database::open_initialized(config.db_path())
        .context("failed to open run-history database")?;
    db.insert_run(&summary).context("failed to record run")?;

    report::print_summary(&summary);

    match summary.status {
        RunStatus::Success => Ok(()),
        status => anyhow::bail!("run {} finished with status {}", summary.run_id, status),
    }
}

fn cmd_report(db: &Database) -> Result<()> {
    match db.latest_run().context("failed to read latest run")? {
        Some(summary) => report::print_summary(&summary),
        None => println!("No runs recorded yet."),
    }
    Ok(())
}

fn cmd_history(db: &Database, limit: u32) -> Result<()> {
    let entries = db.list_runs(limit).context("failed to list runs")?;

    if entries.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("Run History (last {})", limit)));
    println!();
    println!("{}", report::history_table(&entries));

    let failed: Vec<_> = entries
        .iter()
        .filter_map(|e| e.fatal_error.as_deref().map(|err| (&e.id, err)))
        .collect();
    for (id, err) in failed {
        println!("  {} {}", style::dim(&id[..8.min(id.len())]), style::error(err));
    }

    println!();
    println!("{} run(s) shown", entries.len());
    Ok(())
}

fn cmd_show(db: &Database, id: &str) -> Result<()> {
    let summary = db
        .get_run(id)
        .with_context(|| format!("failed to load run '{}'", id))?;
    report::print_summary(&summary);
    Ok(())
}

fn cmd_prune(db: &Database, keep: u32) -> Result<()> {
    let removed = db.prune_runs(keep).context("failed to prune run history")?;
    println!(
        "{}",
        style::success(&format!("Removed {} run(s), kept the newest {}", removed, keep))
    );
    Ok(())
}
