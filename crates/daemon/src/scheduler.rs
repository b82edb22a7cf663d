//! Sweep scheduler that runs reconciliation on a fixed interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use rostersync_core::db::Database;
use rostersync_core::{Connection, RunStatus, RunSummary, SyncEngine};

/// Tracks aggregate statistics across sweeps.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_sweeps: AtomicU64,
    pub total_writes: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub failed_sweeps: AtomicU64,
    pub consecutive_failures: AtomicU64,
}

/// The sweep scheduler.
///
/// Owns both store connections and the run-history database. A sweep that
/// is still running when the next tick arrives causes that tick to be
/// skipped rather than queued.
pub struct Scheduler {
    engine: SyncEngine,
    conn_a: Box<dyn Connection>,
    conn_b: Box<dyn Connection>,
    db: Database,
    poll_interval: Duration,
    history_keep: u32,
    running: AtomicBool,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        engine: SyncEngine,
        conn_a: Box<dyn Connection>,
        conn_b: Box<dyn Connection>,
        db: Database,
        poll_interval: Duration,
        history_keep: u32,
    ) -> Self {
        Self {
            engine,
            conn_a,
            conn_b,
            db,
            poll_interval,
            history_keep,
            running: AtomicBool::new(false),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. The first sweep starts immediately; the loop
    /// returns once `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stop = shutdown.notified();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep("scheduled").await;
                }
            }
        }
    }

    /// Run one sweep unless another is in progress. Returns the summary of
    /// the sweep that ran.
    pub async fn sweep(&self, trigger: &str) -> Option<RunSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(trigger, "skipping sweep: previous sweep still running");
            return None;
        }

        let sweep_num = self.stats.total_sweeps.fetch_add(1, Ordering::SeqCst) + 1;
        info!(sweep = sweep_num, trigger, "starting sweep");

        let summary = self
            .engine
            .run(self.conn_a.as_ref(), self.conn_b.as_ref())
            .await;

        self.record_stats(sweep_num, &summary);
        self.persist(&summary);

        self.running.store(false, Ordering::SeqCst);
        Some(summary)
    }

    fn record_stats(&self, sweep_num: u64, summary: &RunSummary) {
        self.stats
            .total_writes
            .fetch_add(summary.total_writes() as u64, Ordering::SeqCst);
        self.stats
            .total_conflicts
            .fetch_add(summary.conflicts.len() as u64, Ordering::SeqCst);

        match summary.status {
            RunStatus::Failed => {
                let failed = self.stats.failed_sweeps.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self
                    .stats
                    .consecutive_failures
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                error!(
                    sweep = sweep_num,
                    run_id = %summary.run_id,
                    error = summary.fatal_error.as_deref().unwrap_or("unknown"),
                    failed_sweeps = failed,
                    consecutive_failures = consecutive,
                    "sweep failed"
                );
            }
            status => {
                self.stats.consecutive_failures.store(0, Ordering::SeqCst);
                if status == RunStatus::PartialFailure {
                    warn!(
                        sweep = sweep_num,
                        run_id = %summary.run_id,
                        errors = summary.errors.len(),
                        "sweep completed with write errors"
                    );
                }
                info!(
                    sweep = sweep_num,
                    run_id = %summary.run_id,
                    matched = summary.matched,
                    writes = summary.total_writes(),
                    conflicts = summary.conflicts.len(),
                    duplicates = summary.duplicates.len(),
                    "sweep completed"
                );
            }
        }
    }

    /// Store the summary and trim the history. Failures here never stop the
    /// scheduler.
    fn persist(&self, summary: &RunSummary) {
        if let Err(e) = self.db.insert_run(summary) {
            error!(run_id = %summary.run_id, error = %e, "failed to record run");
            return;
        }
        if self.history_keep > 0 {
            if let Err(e) = self.db.prune_runs(self.history_keep) {
                warn!(error = %e, "failed to prune run history");
            }
        }
    }
}
