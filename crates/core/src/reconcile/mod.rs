//! Record reconciliation: equivalence matching and field-level resolution.
//!
//! The reconcile subsystem is responsible for:
//! 1. **Matching** -- pairing records across stores by identity tuple.
//! 2. **Diffing** -- deciding per field which side's value wins.
//!
//! Both steps are pure functions of their inputs; all I/O happens in the
//! [`SyncEngine`](crate::sync_engine::SyncEngine).

pub mod diff;
pub mod matcher;

pub use diff::{DiffEngine, FieldPolicy, FieldRule, Resolution, ResolutionPlan};
pub use matcher::{DuplicateIdentity, EquivalenceMatcher, MatchResult, MatchedPair, PivotMatch};
