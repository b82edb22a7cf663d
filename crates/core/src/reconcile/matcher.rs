//! Equivalence matching.
//!
//! Given the full record sets of both stores, the matcher pairs up records
//! that denote the same entity (equal identity tuple over the pivot fields)
//! and partitions the rest into A-only and B-only. Fallback pivot sets get
//! a second look at whatever the earlier sets left unmatched.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::record::{Identity, Record, Side};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Two records, one per store, sharing an identity.
#[derive(Debug, Clone)]
pub struct MatchedPair {
    pub identity: Identity,
    pub a: Record,
    pub b: Record,
}

/// Several records within one store share an identity tuple.
///
/// None of them take part in matching: picking one would risk a blind
/// overwrite of the wrong entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateIdentity {
    pub side: Side,
    pub identity: Identity,
    /// Store identifiers (or input positions when absent) of the records.
    pub records: Vec<String>,
}

impl DuplicateIdentity {
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

/// Number of pairs one pivot set matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PivotMatch {
    pub pivot_fields: Vec<String>,
    pub matched: usize,
}

/// Output of [`EquivalenceMatcher::match_records`].
///
/// Every input record lands in exactly one of `matched`, `only_a`, `only_b`.
#[derive(Debug, Clone, Default)]
pub struct MatchResult {
    pub matched: Vec<MatchedPair>,
    pub only_a: Vec<Record>,
    pub only_b: Vec<Record>,
    pub duplicates: Vec<DuplicateIdentity>,
    /// Pairs matched per pivot set, in the order the sets were tried.
    pub by_pivot: Vec<PivotMatch>,
}

impl MatchResult {
    /// Whether `identity` belongs to a duplicate group on either side.
    pub fn is_duplicated(&self, identity: &Identity) -> bool {
        self.duplicates.iter().any(|d| &d.identity == identity)
    }

    /// Number of input records accounted for across the three partitions.
    pub fn record_count(&self) -> usize {
        self.matched.len() * 2 + self.only_a.len() + self.only_b.len()
    }
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Stateless matcher over two record sets.
pub struct EquivalenceMatcher;

impl EquivalenceMatcher {
    /// Partition `records_a` and `records_b` by identity over `pivot_fields`.
    ///
    /// Output order follows input order, so identical inputs always produce
    /// identical results.
    pub fn match_records(
        records_a: Vec<Record>,
        records_b: Vec<Record>,
        pivot_fields: &[String],
    ) -> MatchResult {
        info!(
            a_count = records_a.len(),
            b_count = records_b.len(),
            pivot = ?pivot_fields,
            "matching records"
        );
        let total = records_a.len() + records_b.len();

        let ids_a: Vec<Option<Identity>> =
            records_a.iter().map(|r| r.identity(pivot_fields)).collect();
        let ids_b: Vec<Option<Identity>> =
            records_b.iter().map(|r| r.identity(pivot_fields)).collect();

        let dup_a = find_duplicates(Side::A, &records_a, &ids_a);
        let dup_b = find_duplicates(Side::B, &records_b, &ids_b);

        let dup_a_ids: HashSet<Identity> = dup_a.iter().map(|d| d.identity.clone()).collect();
        let dup_b_ids: HashSet<Identity> = dup_b.iter().map(|d| d.identity.clone()).collect();

        // Index B by identity, leaving out records that cannot be matched.
        let mut index: HashMap<Identity, usize> = ids_b
            .iter()
            .enumerate()
            .filter_map(|(i, id)| match id {
                Some(id) if !dup_b_ids.contains(id) => Some((id.clone(), i)),
                _ => None,
            })
            .collect();

        let mut slots_b: Vec<Option<Record>> = records_b.into_iter().map(Some).collect();
        let mut result = MatchResult::default();

        for (record, identity) in records_a.into_iter().zip(ids_a) {
            let identity = match identity {
                Some(id) => id,
                None => {
                    debug!(record = ?record.id(), "A record lacks a pivot value");
                    result.only_a.push(record);
                    continue;
                }
            };

            if dup_a_ids.contains(&identity) {
                result.only_a.push(record);
                continue;
            }

            // Removing from the index marks the B record consumed.
            match index.remove(&identity).and_then(|j| slots_b[j].take()) {
                Some(b) => {
                    debug!(identity = %identity, "matched");
                    result.matched.push(MatchedPair {
                        identity,
                        a: record,
                        b,
                    });
                }
                None => result.only_a.push(record),
            }
        }

        result.only_b = slots_b.into_iter().flatten().collect();

        for dup in dup_a.iter().chain(dup_b.iter()) {
            warn!(
                side = %dup.side,
                identity = %dup.identity,
                count = dup.count(),
                "duplicate identity excluded from matching"
            );
        }
        result.duplicates = dup_a;
        result.duplicates.extend(dup_b);

        debug_assert_eq!(result.record_count(), total);
        result.by_pivot.push(PivotMatch {
            pivot_fields: pivot_fields.to_vec(),
            matched: result.matched.len(),
        });

        info!(
            matched = result.matched.len(),
            only_a = result.only_a.len(),
            only_b = result.only_b.len(),
            duplicates = result.duplicates.len(),
            "matching complete"
        );
        result
    }

    /// Match by `primary`, then give each set in `fallbacks` a pass over the
    /// records still unmatched.
    ///
    /// A record that belonged to a duplicate group in an earlier pass sits
    /// out every later pass, so an ambiguous record is never paired by a
    /// weaker key.
    pub fn match_with_fallbacks(
        records_a: Vec<Record>,
        records_b: Vec<Record>,
        primary: &[String],
        fallbacks: &[Vec<String>],
    ) -> MatchResult {
        let mut result = Self::match_records(records_a, records_b, primary);
        let mut held_a = Vec::new();
        let mut held_b = Vec::new();
        let mut previous: &[String] = primary;

        for pivot_fields in fallbacks {
            let (rest_a, dup_a) = hold_back(std::mem::take(&mut result.only_a), &result, previous);
            let (rest_b, dup_b) = hold_back(std::mem::take(&mut result.only_b), &result, previous);
            held_a.extend(dup_a);
            held_b.extend(dup_b);

            let pass = Self::match_records(rest_a, rest_b, pivot_fields);
            result.matched.extend(pass.matched);
            result.only_a = pass.only_a;
            result.only_b = pass.only_b;
            result.duplicates.extend(pass.duplicates);
            result.by_pivot.extend(pass.by_pivot);
            previous = pivot_fields.as_slice();
        }

        result.only_a.extend(held_a);
        result.only_b.extend(held_b);
        result
    }
}

/// Split `records` into those free to enter the next pass and those whose
/// identity under `pivot_fields` is duplicated.
fn hold_back(
    records: Vec<Record>,
    result: &MatchResult,
    pivot_fields: &[String],
) -> (Vec<Record>, Vec<Record>) {
    records.into_iter().partition(|r| match r.identity(pivot_fields) {
        Some(identity) => !result.is_duplicated(&identity),
        None => true,
    })
}

/// Identities shared by more than one record, in first-occurrence order.
fn find_duplicates(
    side: Side,
    records: &[Record],
    identities: &[Option<Identity>],
) -> Vec<DuplicateIdentity> {
    let mut order: Vec<&Identity> = Vec::new();
    let mut positions: HashMap<&Identity, Vec<usize>> = HashMap::new();

    for (i, identity) in identities.iter().enumerate() {
        if let Some(identity) = identity {
            let entry = positions.entry(identity).or_default();
            if entry.is_empty() {
                order.push(identity);
            }
            entry.push(i);
        }
    }

    order
        .into_iter()
        .filter_map(|identity| {
            let indices = &positions[identity];
            if indices.len() < 2 {
                return None;
            }
            Some(DuplicateIdentity {
                side,
                identity: identity.clone(),
                records: indices
                    .iter()
                    .map(|&i| {
                        records[i]
                            .id()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("#{}", i))
                    })
                    .collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pivot(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn member(side: Side, id: &str, email: &str, name: &str) -> Record {
        Record::new(side)
            .with_id(id)
            .with_field("email_address", email)
            .with_field("first_name", name)
    }

    #[test]
    fn test_simple_match() {
        let a = vec![member(Side::A, "a1", "x@y.com", "Jo")];
        let b = vec![member(Side::B, "b1", "x@y.com", "Joe")];
        let result = EquivalenceMatcher::match_records(a, b, &pivot(&["email_address"]));

        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].a.id(), Some("a1"));
        assert_eq!(result.matched[0].b.id(), Some("b1"));
        assert!(result.only_a.is_empty());
        assert!(result.only_b.is_empty());
    }

    #[test]
    fn test_match_ignores_case_and_whitespace() {
        let a = vec![member(Side::A, "a1", "John@X.com", "John")];
        let b = vec![member(Side::B, "b1", "  john@x.com ", "John")];
        let result = EquivalenceMatcher::match_records(a, b, &pivot(&["email_address"]));
        assert_eq!(result.matched.len(), 1);
    }

    #[test]
    fn test_missing_pivot_is_unmatched_on_both_sides() {
        let a = vec![Record::new(Side::A).with_id("a1").with_field("first_name", "Jo")];
        let b = vec![Record::new(Side::B)
            .with_id("b1")
            .with_field("email_address", "   ")];
        let result = EquivalenceMatcher::match_records(a, b, &pivot(&["email_address"]));
        assert!(result.matched.is_empty());
        assert_eq!(result.only_a.len(), 1);
        assert_eq!(result.only_b.len(), 1);
    }

    #[test]
    fn test_duplicate_identity_in_a_is_isolated() {
        let a = vec![
            member(Side::A, "a1", "x@y.com", "Jo"),
            member(Side::A, "a2", "X@Y.com", "Joanne"),
        ];
        let b = vec![member(Side::B, "b1", "x@y.com", "Joe")];
        let result = EquivalenceMatcher::match_records(a, b, &pivot(&["email_address"]));

        assert!(result.matched.is_empty());
        assert_eq!(result.only_a.len(), 2);
        assert_eq!(result.only_b.len(), 1);
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(result.duplicates[0].side, Side::A);
        assert_eq!(result.duplicates[0].records, vec!["a1", "a2"]);
        assert!(result.is_duplicated(&result.only_b[0].identity(&pivot(&["email_address"])).unwrap()));
    }

    fn person(side: Side, id: &str, email: &str, first: &str, last: &str) -> Record {
        member(side, id, email, first).with_field("last_name", last)
    }

    #[test]
    fn test_fallback_pivot_matches_changed_email() {
        let email = pivot(&["email_address"]);
        let names = vec![pivot(&["last_name", "first_name"])];
        let a = vec![
            person(Side::A, "a1", "ada@old.com", "Ada", "Lovelace"),
            person(Side::A, "a2", "alan@x.com", "Alan", "Turing"),
        ];
        let b = vec![
            person(Side::B, "b1", "alan@x.com", "Alan", "Turing"),
            person(Side::B, "b2", "ada@new.com", "ada", "LOVELACE"),
        ];

        let result = EquivalenceMatcher::match_with_fallbacks(a, b, &email, &names);

        assert_eq!(result.matched.len(), 2);
        assert!(result.only_a.is_empty());
        assert!(result.only_b.is_empty());
        assert_eq!(result.matched[1].a.id(), Some("a1"));
        assert_eq!(result.matched[1].b.id(), Some("b2"));
        assert_eq!(
            result.matched[1].identity.to_string(),
            "last_name=lovelace, first_name=ada"
        );
        assert_eq!(
            result.by_pivot,
            vec![
                PivotMatch { pivot_fields: email.clone(), matched: 1 },
                PivotMatch { pivot_fields: names[0].clone(), matched: 1 },
            ]
        );
    }

    #[test]
    fn test_fallback_pass_skips_earlier_duplicates() {
        let email = pivot(&["email_address"]);
        let names = vec![pivot(&["last_name", "first_name"])];
        let a = vec![
            person(Side::A, "a1", "shared@x.com", "Ada", "Lovelace"),
            person(Side::A, "a2", "shared@x.com", "Alan", "Turing"),
        ];
        let b = vec![person(Side::B, "b1", "ada@x.com", "Ada", "Lovelace")];

        let result = EquivalenceMatcher::match_with_fallbacks(a, b, &email, &names);

        assert!(result.matched.is_empty());
        assert_eq!(result.only_a.len(), 2);
        assert_eq!(result.only_b.len(), 1);
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(result.by_pivot[1].matched, 0);
        assert_eq!(result.record_count(), 3);
    }

    #[test]
    fn test_fallback_pass_reports_its_own_duplicates() {
        let email = pivot(&["email_address"]);
        let names = vec![pivot(&["last_name", "first_name"])];
        let a = vec![
            person(Side::A, "a1", "one@x.com", "Jo", "Smith"),
            person(Side::A, "a2", "two@x.com", "Jo", "Smith"),
        ];
        let b = vec![person(Side::B, "b1", "three@x.com", "Jo", "Smith")];

        let result = EquivalenceMatcher::match_with_fallbacks(a, b, &email, &names);

        assert!(result.matched.is_empty());
        assert_eq!(result.duplicates.len(), 1);
        assert_eq!(result.duplicates[0].records, vec!["a1", "a2"]);
        assert!(!result.is_duplicated(&result.only_a[0].identity(&email).unwrap()));
    }

    #[test]
    fn test_duplicate_identity_in_b_is_isolated() {
        let a = vec![member(Side::A, "a1", "x@y.com", "Jo")];
        let b = vec![
            member(Side::B, "b1", "x@y.com", "Joe"),
            Record::new(Side::B).with_field("email_address", "x@y.com"),
        ];
        let result = EquivalenceMatcher::match_records(a, b, &pivot(&["email_address"]));

        assert!(result.matched.is_empty());
        assert_eq!(result.only_a.len(), 1);
        assert_eq!(result.only_b.len(), 2);
        assert_eq!(result.duplicates[0].side, Side::B);
        assert_eq!(result.duplicates[0].records, vec!["b1", "#1"]);
    }

    #[test]
    fn test_multi_field_pivot() {
        let p = pivot(&["last_name", "first_name"]);
        let a = vec![
            Record::new(Side::A)
                .with_field("first_name", "Ada")
                .with_field("last_name", "Lovelace"),
            Record::new(Side::A)
                .with_field("first_name", "Ada")
                .with_field("last_name", "Byron"),
        ];
        let b = vec![Record::new(Side::B)
            .with_field("first_name", "ada")
            .with_field("last_name", "LOVELACE")];
        let result = EquivalenceMatcher::match_records(a, b, &p);
        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.only_a.len(), 1);
        assert_eq!(
            result.matched[0].identity.to_string(),
            "last_name=lovelace, first_name=ada"
        );
    }

    #[test]
    fn test_partition_completeness() {
        let p = pivot(&["email_address"]);
        let cases: Vec<(Vec<Record>, Vec<Record>)> = vec![
            (vec![], vec![]),
            (vec![member(Side::A, "a1", "a@b.com", "A")], vec![]),
            (vec![], vec![member(Side::B, "b1", "a@b.com", "A")]),
            (
                vec![
                    member(Side::A, "a1", "a@b.com", "A"),
                    member(Side::A, "a2", "a@b.com", "A2"),
                    member(Side::A, "a3", "c@d.com", "C"),
                    Record::new(Side::A),
                ],
                vec![
                    member(Side::B, "b1", "a@b.com", "A"),
                    member(Side::B, "b2", "c@d.com", "C"),
                    member(Side::B, "b3", "e@f.com", "E"),
                    member(Side::B, "b4", "e@f.com", "E"),
                ],
            ),
        ];

        for (a, b) in cases {
            let total = a.len() + b.len();
            let result = EquivalenceMatcher::match_records(a, b, &p);
            assert_eq!(result.record_count(), total);
        }
    }

    #[test]
    fn test_matching_is_deterministic() {
        let p = pivot(&["email_address"]);
        let a = vec![
            member(Side::A, "a1", "a@b.com", "A"),
            member(Side::A, "a2", "z@b.com", "Z"),
            member(Side::A, "a3", "m@b.com", "M"),
        ];
        let b = vec![
            member(Side::B, "b1", "m@b.com", "M"),
            member(Side::B, "b2", "a@b.com", "A"),
            member(Side::B, "b3", "q@b.com", "Q"),
        ];

        let first = EquivalenceMatcher::match_records(a.clone(), b.clone(), &p);
        let second = EquivalenceMatcher::match_records(a, b, &p);

        let ids = |r: &MatchResult| {
            (
                r.matched
                    .iter()
                    .map(|m| (m.a.id().map(String::from), m.b.id().map(String::from)))
                    .collect::<Vec<_>>(),
                r.only_a.iter().map(|r| r.id().map(String::from)).collect::<Vec<_>>(),
                r.only_b.iter().map(|r| r.id().map(String::from)).collect::<Vec<_>>(),
            )
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.matched[0].a.id(), Some("a1"));
        assert_eq!(first.only_a[0].id(), Some("a2"));
        assert_eq!(first.only_b[0].id(), Some("b3"));
    }
}
