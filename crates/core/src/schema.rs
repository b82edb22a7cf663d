//! Declared record schema.
//!
//! Each deployment declares the shared field vocabulary once in config, as a
//! map of field name to [`ValueKind`]. The matcher and diff engine never
//! consult the schema; adapters use it to type incoming store values, and
//! config validation uses it to reject unknown pivot or rule fields.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::FieldValue;

/// The kind of value a declared field holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Number,
    Date,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Number => write!(f, "number"),
            Self::Date => write!(f, "date"),
        }
    }
}

/// Field name -> value kind for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSchema {
    pub fields: BTreeMap<String, ValueKind>,
}

impl Default for RecordSchema {
    /// The member schema both stores share out of the box.
    fn default() -> Self {
        let fields = [
            ("email_address", ValueKind::Text),
            ("first_name", ValueKind::Text),
            ("last_name", ValueKind::Text),
            ("zip_code", ValueKind::Text),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        Self { fields }
    }
}

impl RecordSchema {
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn kind_of(&self, field: &str) -> Option<ValueKind> {
        self.fields.get(field).copied()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Type a raw JSON value from a store according to the declared kind.
    ///
    /// Values that do not fit the kind are kept as text rather than dropped,
    /// so a malformed cell still shows up as a difference instead of being
    /// silently treated as empty.
    pub fn coerce(&self, field: &str, raw: &serde_json::Value) -> FieldValue {
        let kind = self.kind_of(field).unwrap_or(ValueKind::Text);
        coerce_json(kind, raw)
    }
}

/// Convert a JSON value to a [`FieldValue`] of the given kind.
pub fn coerce_json(kind: ValueKind, raw: &serde_json::Value) -> FieldValue {
    use serde_json::Value;

    match (kind, raw) {
        (_, Value::Null) => FieldValue::Null,
        (ValueKind::Number, Value::Number(n)) => n
            .as_f64()
            .map(FieldValue::Number)
            .unwrap_or_else(|| FieldValue::Text(n.to_string())),
        (ValueKind::Number, Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(n) => FieldValue::Number(n),
            Err(_) => FieldValue::Text(s.clone()),
        },
        (ValueKind::Date, Value::String(s)) => parse_date(s)
            .map(FieldValue::Date)
            .unwrap_or_else(|| FieldValue::Text(s.clone())),
        (_, Value::String(s)) => FieldValue::Text(s.clone()),
        (_, Value::Number(n)) => FieldValue::Text(n.to_string()),
        (_, Value::Bool(b)) => FieldValue::Text(b.to_string()),
        (_, other) => {
            debug!(kind = %kind, "non-scalar store value kept as JSON text");
            FieldValue::Text(other.to_string())
        }
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_member_schema() {
        let schema = RecordSchema::default();
        assert!(schema.contains("email_address"));
        assert_eq!(schema.kind_of("zip_code"), Some(ValueKind::Text));
        assert_eq!(schema.kind_of("phone"), None);
    }

    #[test]
    fn test_coerce_by_kind() {
        assert_eq!(
            coerce_json(ValueKind::Number, &json!("42")),
            FieldValue::Number(42.0)
        );
        assert_eq!(
            coerce_json(ValueKind::Text, &json!(94704)),
            FieldValue::text("94704")
        );
        assert_eq!(coerce_json(ValueKind::Date, &json!(null)), FieldValue::Null);
        assert!(matches!(
            coerce_json(ValueKind::Date, &json!("2024-05-01")),
            FieldValue::Date(_)
        ));
    }

    #[test]
    fn test_malformed_value_kept_as_text() {
        assert_eq!(
            coerce_json(ValueKind::Number, &json!("n/a")),
            FieldValue::text("n/a")
        );
        assert_eq!(
            coerce_json(ValueKind::Date, &json!("yesterday")),
            FieldValue::text("yesterday")
        );
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("2017-03-27T21:20:13Z").is_some());
        assert!(parse_date("2017-03-27T21:20:13.000Z").is_some());
        assert!(parse_date("2017-03-27").is_some());
        assert!(parse_date("03/27/2017").is_none());
    }

    #[test]
    fn test_schema_from_toml() {
        let schema: RecordSchema = toml::from_str(
            r#"
[fields]
email_address = "text"
dues_paid = "number"
joined = "date"
"#,
        )
        .unwrap();
        assert_eq!(schema.kind_of("dues_paid"), Some(ValueKind::Number));
        assert_eq!(schema.kind_of("joined"), Some(ValueKind::Date));
    }
}
