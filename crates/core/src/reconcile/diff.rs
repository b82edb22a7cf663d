//! Field-level diffing and resolution.
//!
//! For a matched pair, the [`DiffEngine`] compares every field either record
//! carries and decides per field which side's value (if any) should be
//! written, according to a [`FieldPolicy`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{FieldChanges, FieldValue, Record, Side};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How a differing field is resolved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    /// Store A's value always wins.
    PreferA,
    /// Store B's value always wins.
    PreferB,
    /// The non-empty side wins; two different non-empty values conflict.
    #[default]
    PreferNonEmpty,
    /// The record with the later last-modified timestamp wins. Falls back to
    /// `PreferNonEmpty` when either timestamp is missing or they are equal.
    MostRecentlyUpdated,
}

impl std::fmt::Display for FieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreferA => write!(f, "prefer_a"),
            Self::PreferB => write!(f, "prefer_b"),
            Self::PreferNonEmpty => write!(f, "prefer_non_empty"),
            Self::MostRecentlyUpdated => write!(f, "most_recently_updated"),
        }
    }
}

/// Per-field resolution rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldPolicy {
    /// Explicit rule per field name.
    #[serde(default)]
    pub rules: BTreeMap<String, FieldRule>,

    /// Rule for fields without an explicit entry.
    #[serde(default)]
    pub default_rule: FieldRule,

    /// Fields compared on their raw value instead of the normalized one, so
    /// that a case- or whitespace-only difference counts as a difference.
    #[serde(default)]
    pub exact_fields: BTreeSet<String>,
}

impl FieldPolicy {
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.rules.insert(field.into(), rule);
        self
    }

    pub fn with_exact_field(mut self, field: impl Into<String>) -> Self {
        self.exact_fields.insert(field.into());
        self
    }

    pub fn rule_for(&self, field: &str) -> FieldRule {
        self.rules.get(field).copied().unwrap_or(self.default_rule)
    }

    fn values_equal(&self, field: &str, a: &FieldValue, b: &FieldValue) -> bool {
        if self.exact_fields.contains(field) {
            a.exact_eq(b)
        } else {
            a.normalized_eq(b)
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The decision for one field of a matched pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Both sides already agree.
    NoChange,
    /// A's value wins and must be written to B.
    TakeA(FieldValue),
    /// B's value wins and must be written to A.
    TakeB(FieldValue),
    /// The values differ and the rule cannot pick a winner. Never written.
    Conflict { a: FieldValue, b: FieldValue },
}

impl Resolution {
    /// The store that has to be written for this decision, if any.
    pub fn write_target(&self) -> Option<Side> {
        match self {
            Self::TakeA(_) => Some(Side::B),
            Self::TakeB(_) => Some(Side::A),
            _ => None,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChange => write!(f, "no-change"),
            Self::TakeA(v) => write!(f, "take-A ({})", v),
            Self::TakeB(v) => write!(f, "take-B ({})", v),
            Self::Conflict { a, b } => write!(f, "conflict ({} vs {})", a, b),
        }
    }
}

/// Per-field decisions for one matched pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionPlan {
    entries: BTreeMap<String, Resolution>,
}

impl ResolutionPlan {
    pub fn get(&self, field: &str) -> Option<&Resolution> {
        self.entries.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resolution)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All resolved values that must be written to `target`.
    pub fn changes_for(&self, target: Side) -> FieldChanges {
        self.entries
            .iter()
            .filter_map(|(field, resolution)| match resolution {
                Resolution::TakeA(v) if target == Side::B => Some((field.clone(), v.clone())),
                Resolution::TakeB(v) if target == Side::A => Some((field.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Fields that need any write at all.
    pub fn write_count(&self) -> usize {
        self.entries
            .values()
            .filter(|r| r.write_target().is_some())
            .count()
    }

    /// Unresolved fields as `(field, value_a, value_b)`.
    pub fn conflicts(&self) -> impl Iterator<Item = (&str, &FieldValue, &FieldValue)> {
        self.entries.iter().filter_map(|(field, r)| match r {
            Resolution::Conflict { a, b } => Some((field.as_str(), a, b)),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless field-level diff engine.
pub struct DiffEngine;

impl DiffEngine {
    /// Compute the resolution plan for a matched pair.
    ///
    /// Every field carried by either record appears in the plan; a field
    /// missing from one record compares as null.
    pub fn diff(a: &Record, b: &Record, policy: &FieldPolicy) -> ResolutionPlan {
        let fields: BTreeSet<&str> = a
            .fields()
            .keys()
            .chain(b.fields().keys())
            .map(String::as_str)
            .collect();

        let entries = fields
            .into_iter()
            .map(|field| {
                let va = a.field(field);
                let vb = b.field(field);
                let resolution = if policy.values_equal(field, va, vb) {
                    Resolution::NoChange
                } else {
                    resolve(policy.rule_for(field), a, b, va, vb)
                };
                if resolution != Resolution::NoChange {
                    debug!(field, decision = %resolution, "field differs");
                }
                (field.to_string(), resolution)
            })
            .collect();

        ResolutionPlan { entries }
    }
}

fn resolve(rule: FieldRule, a: &Record, b: &Record, va: &FieldValue, vb: &FieldValue) -> Resolution {
    match rule {
        FieldRule::PreferA => Resolution::TakeA(va.clone()),
        FieldRule::PreferB => Resolution::TakeB(vb.clone()),
        FieldRule::PreferNonEmpty => prefer_non_empty(va, vb),
        FieldRule::MostRecentlyUpdated => match (a.last_modified(), b.last_modified()) {
            (Some(ta), Some(tb)) if ta > tb => Resolution::TakeA(va.clone()),
            (Some(ta), Some(tb)) if tb > ta => Resolution::TakeB(vb.clone()),
            _ => prefer_non_empty(va, vb),
        },
    }
}

fn prefer_non_empty(va: &FieldValue, vb: &FieldValue) -> Resolution {
    match (va.is_empty(), vb.is_empty()) {
        (false, true) => Resolution::TakeA(va.clone()),
        (true, false) => Resolution::TakeB(vb.clone()),
        _ => Resolution::Conflict {
            a: va.clone(),
            b: vb.clone(),
        },
    }
}
