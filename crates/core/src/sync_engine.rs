//! Two-store reconciliation engine.
//!
//! The [`SyncEngine`] orchestrates one reconciliation run:
//!
//! 1. Fetch the full record set from store A, then from store B.
//! 2. Match records across stores by identity tuple, then by each fallback
//!    pivot set over what is left.
//! 3. Create unmatched records on the opposite store, if allowed.
//! 4. Diff every matched pair and write the winning values.
//! 5. Return a [`RunSummary`].
//!
//! A fetch failure aborts the run before any write. A failed create or
//! update is recorded against its record and the run carries on.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::errors::{FetchError, WriteError};
use crate::reconcile::{DiffEngine, EquivalenceMatcher, FieldPolicy, MatchResult, MatchedPair};
use crate::record::{Record, Side};
use crate::summary::{
    FieldConflict, PlannedWrite, RecordError, RunSummary, SkipReason, SkippedRecord, WriteKind,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Which stores a run may write to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Both stores are written.
    #[default]
    Bidirectional,
    /// Only store B is written; A is the source of truth.
    AToB,
    /// Only store A is written; B is the source of truth.
    BToA,
}

impl SyncDirection {
    pub fn allows_write_to(self, target: Side) -> bool {
        match self {
            Self::Bidirectional => true,
            Self::AToB => target == Side::B,
            Self::BToA => target == Side::A,
        }
    }
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bidirectional => write!(f, "bidirectional"),
            Self::AToB => write!(f, "a_to_b"),
            Self::BToA => write!(f, "b_to_a"),
        }
    }
}

/// Everything a run needs besides the two connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Ordered pivot field names forming the identity tuple.
    pub pivot_fields: Vec<String>,
    /// Further pivot sets tried, in order, on records left unmatched.
    pub fallback_pivots: Vec<Vec<String>>,
    /// Fields both stores can hold. Anything else is dropped from fetched
    /// records before matching. `None` keeps every field.
    pub shared_fields: Option<BTreeSet<String>>,
    pub policy: FieldPolicy,
    pub direction: SyncDirection,
    /// Create records that exist in only one store on the other store.
    pub create_missing: bool,
    /// Compute and report every write without performing any.
    pub dry_run: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            pivot_fields: vec!["email_address".to_string()],
            fallback_pivots: Vec::new(),
            shared_fields: None,
            policy: FieldPolicy::default(),
            direction: SyncDirection::Bidirectional,
            create_missing: true,
            dry_run: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The two connections of a run, addressable by side.
#[derive(Clone, Copy)]
struct Stores<'c> {
    a: &'c dyn Connection,
    b: &'c dyn Connection,
}

impl<'c> Stores<'c> {
    fn get(&self, side: Side) -> &'c dyn Connection {
        match side {
            Side::A => self.a,
            Side::B => self.b,
        }
    }
}

/// The reconciliation engine.
///
/// Holds no state between runs; every run starts from a full fetch.
pub struct SyncEngine {
    settings: ReconcileSettings,
}

impl SyncEngine {
    pub fn new(settings: ReconcileSettings) -> Self {
        info!(
            pivot = ?settings.pivot_fields,
            fallback_pivots = settings.fallback_pivots.len(),
            direction = %settings.direction,
            create_missing = settings.create_missing,
            dry_run = settings.dry_run,
            "initializing sync engine"
        );
        Self { settings }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full reconciliation run between `conn_a` and `conn_b`.
    ///
    /// Never returns an error: a fetch failure yields a summary with status
    /// `failed` and the fatal error, and no write is attempted.
    pub async fn run(&self, conn_a: &dyn Connection, conn_b: &dyn Connection) -> RunSummary {
        let stores = Stores { a: conn_a, b: conn_b };
        let mut summary = RunSummary::new(
            conn_a.name(),
            conn_b.name(),
            self.settings.direction,
            self.settings.dry_run,
        );
        info!(
            run_id = %summary.run_id,
            store_a = conn_a.name(),
            store_b = conn_b.name(),
            "starting reconciliation run"
        );

        // 1. Fetch, A first. Nothing is written unless both succeed.
        let records_a = match fetch(conn_a).await {
            Ok(records) => records,
            Err(e) => return self.abort(summary, e),
        };
        let records_b = match fetch(conn_b).await {
            Ok(records) => records,
            Err(e) => return self.abort(summary, e),
        };
        summary.fetched_a = records_a.len();
        summary.fetched_b = records_b.len();

        // 2. Match.
        let shared = self.settings.shared_fields.as_ref();
        let result = EquivalenceMatcher::match_with_fallbacks(
            prepare(records_a, Side::A, shared),
            prepare(records_b, Side::B, shared),
            &self.settings.pivot_fields,
            &self.settings.fallback_pivots,
        );
        summary.matched = result.matched.len();
        summary.matched_by = result.by_pivot.clone();
        summary.duplicates = result.duplicates.clone();

        // 3. Unmatched records.
        for record in result.only_a.iter().chain(result.only_b.iter()) {
            self.reconcile_unmatched(record, stores, &result, &mut summary)
                .await;
        }

        // 4. Matched pairs.
        for pair in &result.matched {
            self.reconcile_pair(pair, stores, &mut summary).await;
        }

        summary.finish();
        info!(
            run_id = %summary.run_id,
            status = %summary.status,
            matched = summary.matched,
            created_in_a = summary.created_in_a,
            created_in_b = summary.created_in_b,
            updated_in_a = summary.updated_in_a,
            updated_in_b = summary.updated_in_b,
            conflicts = summary.conflicts.len(),
            errors = summary.errors.len(),
            "reconciliation run completed"
        );
        summary
    }

    fn abort(&self, mut summary: RunSummary, err: FetchError) -> RunSummary {
        error!(run_id = %summary.run_id, error = %err, "run aborted before any write");
        summary.abort(&err);
        summary
    }

    // -----------------------------------------------------------------------
    // Unmatched records
    // -----------------------------------------------------------------------

    async fn reconcile_unmatched(
        &self,
        record: &Record,
        stores: Stores<'_>,
        result: &MatchResult,
        summary: &mut RunSummary,
    ) {
        let pivot = &self.settings.pivot_fields;
        let target = record.source().other();
        let label = record.label(pivot);

        let skip = if !self.settings.direction.allows_write_to(target) {
            Some(SkipReason::DirectionForbids)
        } else if !self.settings.create_missing {
            Some(SkipReason::CreateDisabled)
        } else {
            match record.identity(pivot) {
                None => Some(SkipReason::NoIdentity),
                Some(identity) if result.is_duplicated(&identity) => {
                    Some(SkipReason::DuplicateIdentity)
                }
                Some(_) => None,
            }
        };

        if let Some(reason) = skip {
            debug!(record = %label, target = %target, reason = %reason, "skipping unmatched record");
            summary.skipped.push(SkippedRecord {
                target,
                kind: WriteKind::Create,
                record: label,
                reason,
            });
            return;
        }

        let new_record = record.for_create();
        if self.settings.dry_run {
            debug!(record = %label, target = %target, "planned create");
            summary.planned.push(PlannedWrite {
                target,
                kind: WriteKind::Create,
                record: label,
                fields: new_record.fields().clone(),
            });
            return;
        }

        let conn = stores.get(target);
        match conn.create(&new_record).await {
            Ok(created) => {
                info!(
                    record = %label,
                    store = conn.name(),
                    id = created.id().unwrap_or("-"),
                    "created record"
                );
                summary.record_created(target);
            }
            Err(e) => {
                warn!(record = %label, store = conn.name(), error = %e, "create failed");
                summary.errors.push(RecordError {
                    target,
                    kind: WriteKind::Create,
                    record: label,
                    message: e.to_string(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Matched pairs
    // -----------------------------------------------------------------------

    async fn reconcile_pair(&self, pair: &MatchedPair, stores: Stores<'_>, summary: &mut RunSummary) {
        let plan = DiffEngine::diff(&pair.a, &pair.b, &self.settings.policy);
        let label = pair.identity.to_string();

        for (field, value_a, value_b) in plan.conflicts() {
            debug!(record = %label, field, "unresolved conflict");
            summary.conflicts.push(FieldConflict {
                identity: label.clone(),
                field: field.to_string(),
                value_a: value_a.clone(),
                value_b: value_b.clone(),
            });
        }

        if plan.write_count() == 0 {
            summary.unchanged += 1;
            return;
        }

        for target in [Side::A, Side::B] {
            let changes = plan.changes_for(target);
            if changes.is_empty() {
                continue;
            }

            if !self.settings.direction.allows_write_to(target) {
                debug!(record = %label, target = %target, "update not allowed by direction");
                summary.skipped.push(SkippedRecord {
                    target,
                    kind: WriteKind::Update,
                    record: label.clone(),
                    reason: SkipReason::DirectionForbids,
                });
                continue;
            }

            if self.settings.dry_run {
                debug!(record = %label, target = %target, fields = changes.len(), "planned update");
                summary.planned.push(PlannedWrite {
                    target,
                    kind: WriteKind::Update,
                    record: label.clone(),
                    fields: changes,
                });
                continue;
            }

            let conn = stores.get(target);
            let existing = match target {
                Side::A => &pair.a,
                Side::B => &pair.b,
            };
            let result = match existing.id() {
                Some(id) => conn.update(id, &changes).await,
                None => Err(WriteError::MissingIdentifier {
                    store: conn.name().to_string(),
                }),
            };

            match result {
                Ok(()) => {
                    info!(
                        record = %label,
                        store = conn.name(),
                        fields = ?changes.keys().collect::<Vec<_>>(),
                        "updated record"
                    );
                    summary.record_updated(target);
                }
                Err(e) => {
                    warn!(record = %label, store = conn.name(), error = %e, "update failed");
                    summary.errors.push(RecordError {
                        target,
                        kind: WriteKind::Update,
                        record: label.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

async fn fetch(conn: &dyn Connection) -> Result<Vec<Record>, FetchError> {
    info!(store = conn.name(), "fetching records");
    let records = conn.fetch_all().await?;
    info!(store = conn.name(), count = records.len(), "fetched records");
    Ok(records)
}

/// Tag every record with the side it was fetched from, whatever the adapter
/// set, and drop fields the other store cannot hold.
fn prepare(records: Vec<Record>, side: Side, shared: Option<&BTreeSet<String>>) -> Vec<Record> {
    records
        .into_iter()
        .map(|r| {
            let r = r.tagged(side);
            match shared {
                Some(fields) => r.restricted_to(fields),
                None => r,
            }
        })
        .collect()
}
