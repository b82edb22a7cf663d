//! Run summary: the outcome of one reconciliation run.
//!
//! The summary is the only artifact a run leaves behind. It is serialized to
//! JSON for the run-history database and rendered by the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reconcile::{DuplicateIdentity, PivotMatch};
use crate::record::{FieldChanges, FieldValue, Side};
use crate::sync_engine::SyncDirection;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every planned write succeeded.
    Success,
    /// At least one create or update failed; the rest were applied.
    PartialFailure,
    /// A fetch failed and no write was attempted.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial_failure"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial_failure" => Some(Self::PartialFailure),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-record entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Create,
    Update,
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// A field both stores hold different values for, with no rule to pick one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldConflict {
    pub identity: String,
    pub field: String,
    pub value_a: FieldValue,
    pub value_b: FieldValue,
}

/// A failed create or update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordError {
    /// The store the write was sent to.
    pub target: Side,
    pub kind: WriteKind,
    pub record: String,
    pub message: String,
}

/// Why a record was left alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The sync direction does not allow writing to the target store.
    DirectionForbids,
    /// Creation of missing records is disabled.
    CreateDisabled,
    /// The record has no complete identity and could never be matched.
    NoIdentity,
    /// The record's identity is shared by several records.
    DuplicateIdentity,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectionForbids => write!(f, "direction forbids writes"),
            Self::CreateDisabled => write!(f, "creation disabled"),
            Self::NoIdentity => write!(f, "missing pivot value"),
            Self::DuplicateIdentity => write!(f, "duplicate identity"),
        }
    }
}

/// A write the run decided not to perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    /// The store the write would have gone to.
    pub target: Side,
    pub kind: WriteKind,
    pub record: String,
    pub reason: SkipReason,
}

/// A write computed during a dry run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedWrite {
    pub target: Side,
    pub kind: WriteKind,
    pub record: String,
    pub fields: FieldChanges,
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Counts and per-record reports of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub direction: SyncDirection,
    pub dry_run: bool,
    pub store_a: String,
    pub store_b: String,

    pub fetched_a: usize,
    pub fetched_b: usize,
    pub matched: usize,
    pub unchanged: usize,
    pub created_in_a: usize,
    pub created_in_b: usize,
    pub updated_in_a: usize,
    pub updated_in_b: usize,
    /// Matched pairs per pivot set, primary set first.
    #[serde(default)]
    pub matched_by: Vec<PivotMatch>,

    #[serde(default)]
    pub conflicts: Vec<FieldConflict>,
    #[serde(default)]
    pub duplicates: Vec<DuplicateIdentity>,
    #[serde(default)]
    pub errors: Vec<RecordError>,
    #[serde(default)]
    pub skipped: Vec<SkippedRecord>,
    #[serde(default)]
    pub planned: Vec<PlannedWrite>,

    pub fatal_error: Option<String>,
}

impl RunSummary {
    /// Start a fresh summary for a run between `store_a` and `store_b`.
    pub fn new(
        store_a: impl Into<String>,
        store_b: impl Into<String>,
        direction: SyncDirection,
        dry_run: bool,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Success,
            direction,
            dry_run,
            store_a: store_a.into(),
            store_b: store_b.into(),
            fetched_a: 0,
            fetched_b: 0,
            matched: 0,
            unchanged: 0,
            created_in_a: 0,
            created_in_b: 0,
            updated_in_a: 0,
            updated_in_b: 0,
            matched_by: Vec::new(),
            conflicts: Vec::new(),
            duplicates: Vec::new(),
            errors: Vec::new(),
            skipped: Vec::new(),
            planned: Vec::new(),
            fatal_error: None,
        }
    }

    /// Display name of the store on `side`.
    pub fn store_name(&self, side: Side) -> &str {
        match side {
            Side::A => &self.store_a,
            Side::B => &self.store_b,
        }
    }

    pub(crate) fn record_created(&mut self, target: Side) {
        match target {
            Side::A => self.created_in_a += 1,
            Side::B => self.created_in_b += 1,
        }
    }

    pub(crate) fn record_updated(&mut self, target: Side) {
        match target {
            Side::A => self.updated_in_a += 1,
            Side::B => self.updated_in_b += 1,
        }
    }

    /// Mark the run as aborted by a fatal error and close it.
    pub(crate) fn abort(&mut self, error: impl std::fmt::Display) {
        self.fatal_error = Some(error.to_string());
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Derive the final status and close the run.
    pub(crate) fn finish(&mut self) {
        self.status = if self.fatal_error.is_some() {
            RunStatus::Failed
        } else if !self.errors.is_empty() {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
        self.completed_at = Some(Utc::now());
    }

    /// Writes actually applied to either store.
    pub fn total_writes(&self) -> usize {
        self.created_in_a + self.created_in_b + self.updated_in_a + self.updated_in_b
    }

    /// Wall-clock duration in milliseconds, once completed.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0))
    }

    /// Whether the run found anything needing human attention.
    pub fn needs_attention(&self) -> bool {
        self.status != RunStatus::Success
            || !self.conflicts.is_empty()
            || !self.duplicates.is_empty()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(err) = &self.fatal_error {
            return write!(f, "{}: {}", self.status, err);
        }
        write!(
            f,
            "{}{}: matched {}, created A/B {}/{}, updated A/B {}/{}, conflicts {}, duplicates {}, errors {}, skipped {}",
            self.status,
            if self.dry_run { " (dry run)" } else { "" },
            self.matched,
            self.created_in_a,
            self.created_in_b,
            self.updated_in_a,
            self.updated_in_b,
            self.conflicts.len(),
            self.duplicates.len(),
            self.errors.len(),
            self.skipped.len()
        )
    }
}
