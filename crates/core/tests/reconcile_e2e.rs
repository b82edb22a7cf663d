//! End-to-end tests for two-store reconciliation.
//!
//! These tests exercise the real `SyncEngine` against in-memory stores that
//! implement `Connection`, apply writes to their own record lists, and log
//! every call. No network I/O.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use rostersync_core::connection::Connection;
use rostersync_core::db::Database;
use rostersync_core::errors::{FetchError, StoreError, WriteError};
use rostersync_core::reconcile::{FieldPolicy, FieldRule};
use rostersync_core::record::{FieldChanges, FieldValue, Record, Side};
use rostersync_core::summary::{RunStatus, SkipReason, WriteKind};
use rostersync_core::sync_engine::{ReconcileSettings, SyncDirection, SyncEngine};

// ===========================================================================
// Helpers
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create(Record),
    Update(String, FieldChanges),
}

/// A store held in memory that applies the writes it receives.
struct MemoryStore {
    name: String,
    records: Mutex<Vec<Record>>,
    calls: Mutex<Vec<Call>>,
    fetches: AtomicUsize,
    next_id: AtomicUsize,
    fail_fetch: bool,
    /// Writes touching a record with one of these emails fail.
    fail_emails: HashSet<String>,
}

impl MemoryStore {
    fn new(name: &str, records: Vec<Record>) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(records),
            calls: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            fail_fetch: false,
            fail_emails: HashSet::new(),
        }
    }

    fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    fn failing_writes_for(mut self, email: &str) -> Self {
        self.fail_emails.insert(email.to_string());
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn should_fail(&self, record: &Record) -> bool {
        match record.field("email_address").normalized() {
            Some(email) => self.fail_emails.contains(&email),
            None => false,
        }
    }

    fn write_error(&self) -> WriteError {
        WriteError::store(
            &self.name,
            StoreError::Api {
                status: 500,
                body: "internal error".into(),
            },
        )
    }
}

#[async_trait]
impl Connection for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch {
            return Err(FetchError::new(
                &self.name,
                StoreError::RetriesExhausted {
                    url: format!("memory://{}", self.name),
                    attempts: 3,
                    last: Box::new(StoreError::Api {
                        status: 503,
                        body: "unavailable".into(),
                    }),
                },
            ));
        }
        Ok(self.records())
    }

    async fn create(&self, record: &Record) -> Result<Record, WriteError> {
        self.calls.lock().unwrap().push(Call::Create(record.clone()));
        if self.should_fail(record) {
            return Err(self.write_error());
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stored = record.clone().with_id(format!("{}-new-{}", self.name, n));
        self.records.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: &str, changes: &FieldChanges) -> Result<(), WriteError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update(id.to_string(), changes.clone()));

        let mut records = self.records.lock().unwrap();
        let pos = records
            .iter()
            .position(|r| r.id() == Some(id))
            .ok_or_else(|| {
                WriteError::store(
                    &self.name,
                    StoreError::Api {
                        status: 404,
                        body: format!("no record {}", id),
                    },
                )
            })?;
        if self.should_fail(&records[pos]) {
            return Err(self.write_error());
        }
        let updated = changes
            .iter()
            .fold(records[pos].clone(), |r, (k, v)| r.with_field(k.as_str(), v.clone()));
        records[pos] = updated;
        Ok(())
    }
}

fn member(side: Side, id: &str, email: &str, first: &str, last: &str) -> Record {
    Record::new(side)
        .with_id(id)
        .with_field("email_address", email)
        .with_field("first_name", first)
        .with_field("last_name", last)
}

fn settings() -> ReconcileSettings {
    ReconcileSettings::default()
}

async fn run(settings: ReconcileSettings, a: &MemoryStore, b: &MemoryStore) -> rostersync_core::RunSummary {
    SyncEngine::new(settings).run(a, b).await
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_prefer_b_takes_b_name() {
    let a = MemoryStore::new(
        "A",
        vec![Record::new(Side::A)
            .with_id("a1")
            .with_field("email_address", "x@y.com")
            .with_field("name", "Jo")],
    );
    let b = MemoryStore::new(
        "B",
        vec![Record::new(Side::B)
            .with_id("b1")
            .with_field("email_address", "x@y.com")
            .with_field("name", "Joe")],
    );
    let mut s = settings();
    s.policy = FieldPolicy::default().with_rule("name", FieldRule::PreferB);

    let summary = run(s, &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.matched, 1);
    assert!(summary.conflicts.is_empty());
    assert_eq!(summary.updated_in_a, 1);
    assert_eq!(summary.updated_in_b, 0);

    let mut expected = FieldChanges::new();
    expected.insert("name".into(), FieldValue::text("Joe"));
    assert_eq!(a.calls(), vec![Call::Update("a1".into(), expected)]);
    assert!(b.calls().is_empty());
}

#[tokio::test]
async fn test_only_a_record_is_created_in_b() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "new@y.com", "Ada", "Lovelace")]);
    let b = MemoryStore::new("B", vec![]);

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.created_in_b, 1);
    assert_eq!(summary.created_in_a, 0);
    assert!(a.calls().is_empty());

    let calls = b.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Call::Create(record) => {
            assert_eq!(record.source(), Side::B);
            assert!(record.id().is_none());
            assert_eq!(record.field("first_name"), &FieldValue::text("Ada"));
        }
        other => panic!("expected a create, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_error_from_a_aborts_before_any_write() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]).failing_fetch();
    let b = MemoryStore::new("B", vec![member(Side::B, "b1", "z@y.com", "Zed", "Z")]);

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::Failed);
    let fatal = summary.fatal_error.as_deref().unwrap_or_default();
    assert!(fatal.contains("failed to fetch records from A"), "fatal: {}", fatal);
    assert_eq!(summary.total_writes(), 0);
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
    assert_eq!(b.fetch_count(), 0);
    assert!(summary.completed_at.is_some());
}

#[tokio::test]
async fn test_fetch_error_from_b_aborts_before_any_write() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]);
    let b = MemoryStore::new("B", vec![]).failing_fetch();

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(a.fetch_count(), 1);
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
}

// ===========================================================================
// Properties
// ===========================================================================

#[tokio::test]
async fn test_no_writes_when_stores_agree() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "X@Y.com", "Jo", "Smith"),
            member(Side::A, "a2", "m@y.com", "Mo", "Jones "),
        ],
    );
    let b = MemoryStore::new(
        "B",
        vec![
            member(Side::B, "b2", "m@y.com", "mo", "jones"),
            member(Side::B, "b1", "x@y.com", "Jo", "Smith"),
        ],
    );

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.unchanged, 2);
    assert_eq!(summary.total_writes(), 0);
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
}

#[tokio::test]
async fn test_conflicting_values_are_reported_not_written() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]);
    let b = MemoryStore::new("B", vec![member(Side::B, "b1", "x@y.com", "Jo", "Smyth")]);

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.conflicts.len(), 1);
    let conflict = &summary.conflicts[0];
    assert_eq!(conflict.identity, "email_address=x@y.com");
    assert_eq!(conflict.field, "last_name");
    assert_eq!(conflict.value_a, FieldValue::text("Smith"));
    assert_eq!(conflict.value_b, FieldValue::text("Smyth"));
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
}

#[tokio::test]
async fn test_duplicate_identity_is_isolated() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "x@y.com", "Jo", "Smith"),
            member(Side::A, "a2", "X@Y.COM", "Joanne", "Smith"),
            member(Side::A, "a3", "ok@y.com", "Ok", "Fine"),
        ],
    );
    let b = MemoryStore::new(
        "B",
        vec![
            member(Side::B, "b1", "x@y.com", "Joe", ""),
            member(Side::B, "b3", "ok@y.com", "Ok", "Fine"),
        ],
    );

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.duplicates.len(), 1);
    assert_eq!(summary.duplicates[0].side, Side::A);
    assert_eq!(summary.duplicates[0].records, vec!["a1", "a2"]);
    assert_eq!(summary.matched, 1);

    // Neither the duplicates nor their B counterpart are touched.
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
    let dup_skips = summary
        .skipped
        .iter()
        .filter(|s| s.reason == SkipReason::DuplicateIdentity)
        .count();
    assert_eq!(dup_skips, 3);
}

#[tokio::test]
async fn test_second_run_converges_to_no_writes() {
    let now = Utc::now();
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "x@y.com", "Jo", "").with_last_modified(Some(now)),
            member(Side::A, "a2", "only-a@y.com", "Al", "Pha"),
        ],
    );
    let b = MemoryStore::new(
        "B",
        vec![
            member(Side::B, "b1", "x@y.com", "", "Smith")
                .with_field("zip_code", "94704")
                .with_last_modified(Some(now - Duration::days(1))),
            member(Side::B, "b2", "only-b@y.com", "Be", "Ta"),
        ],
    );

    let first = run(settings(), &a, &b).await;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.created_in_a, 1);
    assert_eq!(first.created_in_b, 1);
    assert_eq!(first.updated_in_a, 1);
    assert_eq!(first.updated_in_b, 1);

    let second = run(settings(), &a, &b).await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.matched, 3);
    assert_eq!(second.total_writes(), 0);
    assert!(second.conflicts.is_empty());
    assert_eq!(a.records().len(), 3);
    assert_eq!(b.records().len(), 3);
}

// ===========================================================================
// Policy knobs
// ===========================================================================

#[tokio::test]
async fn test_direction_a_to_b_never_writes_a() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "")]);
    let b = MemoryStore::new(
        "B",
        vec![
            member(Side::B, "b1", "x@y.com", "", "Smith"),
            member(Side::B, "b2", "only-b@y.com", "Be", "Ta"),
        ],
    );
    let mut s = settings();
    s.direction = SyncDirection::AToB;

    let summary = run(s, &a, &b).await;

    assert!(a.calls().is_empty());
    assert_eq!(summary.updated_in_b, 1);
    assert_eq!(summary.updated_in_a, 0);
    assert_eq!(summary.created_in_a, 0);

    let forbidden: Vec<_> = summary
        .skipped
        .iter()
        .filter(|s| s.reason == SkipReason::DirectionForbids)
        .map(|s| (s.target, s.kind))
        .collect();
    assert_eq!(
        forbidden,
        vec![(Side::A, WriteKind::Create), (Side::A, WriteKind::Update)]
    );
}

#[tokio::test]
async fn test_create_missing_disabled() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]);
    let b = MemoryStore::new("B", vec![]);
    let mut s = settings();
    s.create_missing = false;

    let summary = run(s, &a, &b).await;

    assert!(b.calls().is_empty());
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].reason, SkipReason::CreateDisabled);
}

#[tokio::test]
async fn test_record_without_identity_is_not_created() {
    let a = MemoryStore::new(
        "A",
        vec![Record::new(Side::A).with_id("a1").with_field("first_name", "Nomail")],
    );
    let b = MemoryStore::new("B", vec![]);

    let summary = run(settings(), &a, &b).await;

    assert!(b.calls().is_empty());
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].reason, SkipReason::NoIdentity);
    assert_eq!(summary.skipped[0].record, "id=a1");
}

#[tokio::test]
async fn test_dry_run_plans_without_writing() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "x@y.com", "Jo", ""),
            member(Side::A, "a2", "only-a@y.com", "Al", "Pha"),
        ],
    );
    let b = MemoryStore::new("B", vec![member(Side::B, "b1", "x@y.com", "Jo", "Smith")]);
    let mut s = settings();
    s.dry_run = true;

    let summary = run(s, &a, &b).await;

    assert!(summary.dry_run);
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());
    assert_eq!(summary.total_writes(), 0);
    assert_eq!(summary.planned.len(), 2);
    assert!(summary
        .planned
        .iter()
        .any(|p| p.kind == WriteKind::Create && p.target == Side::B));
    assert!(summary.planned.iter().any(|p| p.kind == WriteKind::Update
        && p.target == Side::A
        && p.fields.get("last_name") == Some(&FieldValue::text("Smith"))));
}

#[tokio::test]
async fn test_most_recently_updated_wins() {
    let now = Utc::now();
    let a = MemoryStore::new(
        "A",
        vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith").with_last_modified(Some(now))],
    );
    let b = MemoryStore::new(
        "B",
        vec![member(Side::B, "b1", "x@y.com", "Joe", "Smyth")
            .with_last_modified(Some(now - Duration::hours(2)))],
    );
    let mut s = settings();
    s.policy = FieldPolicy {
        default_rule: FieldRule::MostRecentlyUpdated,
        ..Default::default()
    };

    let summary = run(s, &a, &b).await;

    assert!(summary.conflicts.is_empty());
    assert_eq!(summary.updated_in_b, 1);
    let mut expected = FieldChanges::new();
    expected.insert("first_name".into(), FieldValue::text("Jo"));
    expected.insert("last_name".into(), FieldValue::text("Smith"));
    assert_eq!(b.calls(), vec![Call::Update("b1".into(), expected)]);
}

#[tokio::test]
async fn test_multi_field_pivot() {
    let a = MemoryStore::new(
        "A",
        vec![Record::new(Side::A)
            .with_id("a1")
            .with_field("first_name", "Ada")
            .with_field("last_name", "Lovelace")
            .with_field("zip_code", "94704")],
    );
    let b = MemoryStore::new(
        "B",
        vec![Record::new(Side::B)
            .with_id("b1")
            .with_field("first_name", "ada")
            .with_field("last_name", "LOVELACE")],
    );
    let mut s = settings();
    s.pivot_fields = vec!["last_name".into(), "first_name".into()];

    let summary = run(s, &a, &b).await;

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.updated_in_b, 1);
    assert_eq!(summary.created_in_a + summary.created_in_b, 0);
}

#[tokio::test]
async fn test_changed_email_is_matched_by_name_fallback() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "ada@new.com", "Ada", "Lovelace").with_field("zip_code", "94704"),
            member(Side::A, "a2", "alan@x.com", "Alan", "Turing"),
        ],
    );
    let b = MemoryStore::new(
        "B",
        vec![
            member(Side::B, "b1", "ada@old.com", "Ada", "Lovelace"),
            member(Side::B, "b2", "alan@x.com", "Alan", "Turing"),
        ],
    );
    let mut s = settings();
    s.fallback_pivots = vec![vec!["last_name".into(), "first_name".into()]];

    let summary = run(s, &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.created_in_a + summary.created_in_b, 0);
    assert_eq!(summary.matched_by.len(), 2);
    assert_eq!(summary.matched_by[0].matched, 1);
    assert_eq!(summary.matched_by[1].pivot_fields, vec!["last_name", "first_name"]);
    assert_eq!(summary.matched_by[1].matched, 1);

    // The emails differ with no rule to choose, so only the zip code moves.
    assert_eq!(summary.conflicts.len(), 1);
    assert_eq!(summary.conflicts[0].field, "email_address");
    assert_eq!(summary.conflicts[0].identity, "last_name=lovelace, first_name=ada");
    let mut expected = FieldChanges::new();
    expected.insert("zip_code".into(), FieldValue::text("94704"));
    assert_eq!(b.calls(), vec![Call::Update("b1".into(), expected)]);
    assert!(a.calls().is_empty());
}

#[tokio::test]
async fn test_without_fallback_changed_email_creates_both_ways() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "ada@new.com", "Ada", "Lovelace")]);
    let b = MemoryStore::new("B", vec![member(Side::B, "b1", "ada@old.com", "Ada", "Lovelace")]);

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.matched, 0);
    assert_eq!(summary.created_in_a, 1);
    assert_eq!(summary.created_in_b, 1);
    assert_eq!(summary.matched_by.len(), 1);
}

#[tokio::test]
async fn test_fields_outside_shared_set_are_never_written() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "x@y.com", "Jo", "Smith").with_field("zip_code", "94704"),
            member(Side::A, "a2", "new@y.com", "Ada", "Lovelace").with_field("zip_code", "94110"),
        ],
    );
    let b = MemoryStore::new(
        "B",
        vec![Record::new(Side::B)
            .with_id("b1")
            .with_field("email_address", "x@y.com")
            .with_field("last_name", "Smith")],
    );
    let mut s = settings();
    s.shared_fields = Some(
        ["email_address", "first_name", "last_name"]
            .into_iter()
            .map(String::from)
            .collect(),
    );

    let summary = run(s, &a, &b).await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.updated_in_b, 1);
    assert_eq!(summary.created_in_b, 1);
    for call in b.calls() {
        match call {
            Call::Update(id, changes) => {
                assert_eq!(id, "b1");
                assert_eq!(changes.keys().collect::<Vec<_>>(), vec!["first_name"]);
            }
            Call::Create(record) => {
                assert_eq!(record.field("first_name"), &FieldValue::text("Ada"));
                assert!(record.fields().get("zip_code").is_none());
            }
        }
    }
    assert!(a.calls().is_empty());
}

// ===========================================================================
// Failure isolation
// ===========================================================================

#[tokio::test]
async fn test_write_failure_is_isolated() {
    let a = MemoryStore::new(
        "A",
        vec![
            member(Side::A, "a1", "bad@y.com", "Bad", "Apple"),
            member(Side::A, "a2", "good@y.com", "Good", "Egg"),
        ],
    );
    let b = MemoryStore::new("B", vec![]).failing_writes_for("bad@y.com");

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::PartialFailure);
    assert_eq!(summary.created_in_b, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].target, Side::B);
    assert_eq!(summary.errors[0].kind, WriteKind::Create);
    assert_eq!(summary.errors[0].record, "email_address=bad@y.com");
    assert_eq!(b.calls().len(), 2);
}

#[tokio::test]
async fn test_update_without_store_id_is_a_record_error() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]);
    let b = MemoryStore::new(
        "B",
        vec![Record::new(Side::B)
            .with_field("email_address", "x@y.com")
            .with_field("first_name", "Jo")],
    );

    let summary = run(settings(), &a, &b).await;

    assert_eq!(summary.status, RunStatus::PartialFailure);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].message.contains("no B identifier"));
    assert!(b.calls().is_empty());
}

// ===========================================================================
// History
// ===========================================================================

#[tokio::test]
async fn test_summary_is_recorded_in_history() {
    let a = MemoryStore::new("A", vec![member(Side::A, "a1", "x@y.com", "Jo", "Smith")]);
    let b = MemoryStore::new("B", vec![member(Side::B, "b1", "x@y.com", "Jo", "Smyth")]);
    let summary = run(settings(), &a, &b).await;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_initialized(dir.path().join("history.db")).unwrap();
    db.insert_run(&summary).unwrap();

    let runs = db.list_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].conflicts, 1);
    assert_eq!(runs[0].store_a, "A");

    let loaded = db.get_run(&runs[0].id).unwrap();
    assert_eq!(loaded, summary);
}
