//! Airtable adapter.
//!
//! Columns are translated through the configured field map. Listing follows
//! the `offset` cursor; creates `POST` to the table and updates `PATCH` a
//! single record, both with a `{"fields": ...}` body.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::AirtableConfig;
use crate::connection::Connection;
use crate::errors::{FetchError, StoreError, WriteError};
use crate::record::{FieldChanges, FieldValue, Record, Side};
use crate::schema::{parse_date, RecordSchema};
use crate::stores::http::{Auth, HttpTransport, MAX_PAGES};

const PAGE_SIZE: &str = "100";

/// A [`Connection`] to one Airtable table.
pub struct AirtableConnection {
    name: String,
    table_url: String,
    transport: HttpTransport,
    schema: RecordSchema,
    field_map: BTreeMap<String, String>,
    modified_field: Option<String>,
}

impl AirtableConnection {
    pub fn new(config: &AirtableConfig, token: &str, schema: RecordSchema) -> Result<Self, StoreError> {
        let table_url = table_url(&config.api_url, &config.base_id, &config.table)?;
        let transport = HttpTransport::new(Auth::Bearer(token.to_string()))?;
        info!(name = %config.name, url = %table_url, "created Airtable connection");
        Ok(Self {
            name: config.name.clone(),
            table_url,
            transport,
            schema,
            field_map: config.field_map.clone(),
            modified_field: config.modified_field.clone(),
        })
    }

    /// Override the pause after each request.
    pub fn with_request_pause(mut self, pause: Duration) -> Self {
        self.transport = self.transport.with_pause(pause);
        self
    }

    /// `fields[]` parameters restricting the listing to mapped columns.
    fn listing_query(&self) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .field_map
            .values()
            .chain(self.modified_field.iter())
            .map(|column| ("fields[]".to_string(), column.clone()))
            .collect();
        query.push(("pageSize".into(), PAGE_SIZE.into()));
        query
    }

    async fn fetch_pages(&self) -> Result<Vec<Record>, StoreError> {
        let base_query = self.listing_query();
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        for page in 0..MAX_PAGES {
            let mut query = base_query.clone();
            if let Some(offset) = &offset {
                query.push(("offset".into(), offset.clone()));
            }

            let body = self.transport.get_json(&self.table_url, &query).await?;
            let rows = body
                .get("records")
                .and_then(Value::as_array)
                .ok_or_else(|| StoreError::Parse("Airtable response has no 'records' array".into()))?;
            for row in rows {
                records.push(self.to_record(row)?);
            }
            debug!(page, count = rows.len(), "fetched Airtable page");

            match body.get("offset").and_then(Value::as_str) {
                Some(next) => offset = Some(next.to_string()),
                None => return Ok(records),
            }
        }

        Err(StoreError::PageLimit(MAX_PAGES))
    }

    fn to_record(&self, row: &Value) -> Result<Record, StoreError> {
        row_to_record(row, &self.schema, &self.field_map, self.modified_field.as_deref())
    }
}

#[async_trait]
impl Connection for AirtableConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, FetchError> {
        self.fetch_pages()
            .await
            .map_err(|e| FetchError::new(&self.name, e))
    }

    async fn create(&self, record: &Record) -> Result<Record, WriteError> {
        let fields = fields_body(record.fields(), &self.field_map, &self.name)?;
        let body = json!({ "fields": fields, "typecast": true });
        let created = self
            .transport
            .send_json(Method::POST, &self.table_url, &body)
            .await
            .map_err(|e| WriteError::store(&self.name, e))?;
        self.to_record(&created)
            .map_err(|e| WriteError::store(&self.name, e))
    }

    async fn update(&self, id: &str, changes: &FieldChanges) -> Result<(), WriteError> {
        let fields = fields_body(changes, &self.field_map, &self.name)?;
        let body = json!({ "fields": fields, "typecast": true });
        let url = format!("{}/{}", self.table_url, id);
        self.transport
            .send_json(Method::PATCH, &url, &body)
            .await
            .map_err(|e| WriteError::store(&self.name, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire mapping
// ---------------------------------------------------------------------------

/// `{api_url}/{base_id}/{table}` with the table name percent-encoded.
fn table_url(api_url: &str, base_id: &str, table: &str) -> Result<String, StoreError> {
    let mut url = Url::parse(api_url)
        .map_err(|e| StoreError::Parse(format!("invalid Airtable api_url '{}': {}", api_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| StoreError::Parse(format!("Airtable api_url '{}' cannot be a base", api_url)))?
        .pop_if_empty()
        .push(base_id)
        .push(table);
    Ok(url.to_string())
}

/// Translate one Airtable record (`{id, createdTime, fields}`).
pub(crate) fn row_to_record(
    row: &Value,
    schema: &RecordSchema,
    field_map: &BTreeMap<String, String>,
    modified_field: Option<&str>,
) -> Result<Record, StoreError> {
    let id = row
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Parse(format!("Airtable record without id: {}", row)))?;
    let empty = Map::new();
    let cells = row.get("fields").and_then(Value::as_object).unwrap_or(&empty);

    let mut record = Record::new(Side::B).with_id(id);
    for (field, column) in field_map {
        let raw = cells.get(column).unwrap_or(&Value::Null);
        record = record.with_field(field.as_str(), schema.coerce(field, raw));
    }

    let timestamp = match modified_field {
        Some(column) => cells.get(column),
        None => row.get("createdTime"),
    };
    Ok(record.with_last_modified(timestamp.and_then(Value::as_str).and_then(parse_date)))
}

/// Build the `fields` object for a write.
pub(crate) fn fields_body(
    fields: &BTreeMap<String, FieldValue>,
    field_map: &BTreeMap<String, String>,
    store: &str,
) -> Result<Map<String, Value>, WriteError> {
    fields
        .iter()
        .map(|(field, value)| match field_map.get(field) {
            Some(column) => Ok((column.clone(), value.to_json())),
            None => Err(WriteError::UnsupportedField {
                store: store.to_string(),
                field: field.clone(),
                detail: "no Airtable column is mapped".into(),
            }),
        })
        .collect()
}
