//! Store-agnostic record representation.
//!
//! A [`Record`] is an immutable value holding one entity's fields in the
//! normalized field vocabulary shared by every store adapter. Adapters build
//! records from their store's wire format; the matcher and diff engine only
//! ever see records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A set of field changes to write to one record, keyed by field name.
pub type FieldChanges = BTreeMap<String, FieldValue>;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Which of the two reconciled stores a record came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The opposite store.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A single field value.
///
/// Variant order matters for untagged deserialization: an RFC 3339 string is
/// read back as a [`FieldValue::Date`], anything else as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
}

static NULL: FieldValue = FieldValue::Null;

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Canonical comparison form, or `None` for an empty value.
    ///
    /// Text is trimmed and lower-cased, and a blank string counts as empty
    /// exactly like null. Numbers render without a trailing `.0` when they
    /// are integral; dates render as RFC 3339 UTC.
    pub fn normalized(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => {
                let cleaned = s.trim().to_lowercase();
                if cleaned.is_empty() {
                    None
                } else {
                    Some(cleaned)
                }
            }
            Self::Number(n) => Some(render_number(*n)),
            Self::Date(d) => Some(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    /// True for null and blank text.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Raw equality that still treats every empty value as equal.
    pub fn exact_eq(&self, other: &FieldValue) -> bool {
        if self.is_empty() && other.is_empty() {
            return true;
        }
        self == other
    }

    /// Equality after normalization.
    pub fn normalized_eq(&self, other: &FieldValue) -> bool {
        self.normalized() == other.normalized()
    }

    /// Convert to the JSON value an HTTP store expects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Date(d) => {
                serde_json::Value::String(d.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "<empty>"),
            Self::Text(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", render_number(*n)),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The normalized pivot-field values of one record, in pivot order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(Vec<(String, String)>);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One entity as seen by one store, in the normalized field vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    source: Side,
    id: Option<String>,
    fields: BTreeMap<String, FieldValue>,
    last_modified: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(source: Side) -> Self {
        Self {
            source,
            id: None,
            fields: BTreeMap::new(),
            last_modified: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_last_modified(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_modified = at;
        self
    }

    /// Re-tag the record with the store it was fetched from.
    pub fn tagged(mut self, source: Side) -> Self {
        self.source = source;
        self
    }

    pub fn source(&self) -> Side {
        self.source
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Value of `name`, or null when the record does not carry the field.
    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&NULL)
    }

    /// Identity tuple over `pivot_fields`, or `None` if any pivot value is
    /// missing or empty.
    pub fn identity(&self, pivot_fields: &[String]) -> Option<Identity> {
        if pivot_fields.is_empty() {
            return None;
        }
        pivot_fields
            .iter()
            .map(|field| {
                self.field(field)
                    .normalized()
                    .map(|value| (field.clone(), value))
            })
            .collect::<Option<Vec<_>>>()
            .map(Identity)
    }

    /// Copy of this record destined for creation in the other store: no
    /// store identifier, no timestamp, empty fields dropped.
    pub fn for_create(&self) -> Record {
        Record {
            source: self.source.other(),
            id: None,
            fields: self
                .fields
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_modified: None,
        }
    }

    /// The same record carrying only the fields named in `names`.
    pub fn restricted_to(mut self, names: &BTreeSet<String>) -> Record {
        self.fields.retain(|name, _| names.contains(name));
        self
    }

    /// Short human-readable label for logs and reports.
    pub fn label(&self, pivot_fields: &[String]) -> String {
        match (self.identity(pivot_fields), &self.id) {
            (Some(identity), _) => identity.to_string(),
            (None, Some(id)) => format!("id={}", id),
            (None, None) => "<unidentified record>".to_string(),
        }
    }
}
