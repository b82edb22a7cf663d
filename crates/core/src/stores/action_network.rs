//! ActionNetwork adapter over the OSDI people API.
//!
//! Listing walks `GET /people` through `_links.next.href`. New people are
//! added with the person signup helper (`POST /people` wrapping the person
//! in a `person` object); existing ones are edited with `PUT /people/{uuid}`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::ActionNetworkConfig;
use crate::connection::Connection;
use crate::errors::{FetchError, StoreError, WriteError};
use crate::record::{FieldChanges, FieldValue, Record, Side};
use crate::schema::{parse_date, RecordSchema};
use crate::stores::http::{Auth, HttpTransport, MAX_PAGES};

const TOKEN_HEADER: &str = "OSDI-API-Token";
const ID_PREFIX: &str = "action_network:";

/// A [`Connection`] to one ActionNetwork group.
pub struct ActionNetworkConnection {
    name: String,
    people_url: String,
    transport: HttpTransport,
    schema: RecordSchema,
    custom_fields: BTreeMap<String, String>,
}

impl ActionNetworkConnection {
    pub fn new(
        config: &ActionNetworkConfig,
        token: &str,
        schema: RecordSchema,
    ) -> Result<Self, StoreError> {
        let transport = HttpTransport::new(Auth::Header {
            name: TOKEN_HEADER,
            token: token.to_string(),
        })?;
        let people_url = format!("{}/people", config.api_url.trim_end_matches('/'));
        info!(name = %config.name, url = %people_url, "created ActionNetwork connection");
        Ok(Self {
            name: config.name.clone(),
            people_url,
            transport,
            schema,
            custom_fields: config.custom_fields.clone(),
        })
    }

    /// Override the pause after each request.
    pub fn with_request_pause(mut self, pause: Duration) -> Self {
        self.transport = self.transport.with_pause(pause);
        self
    }

    async fn fetch_pages(&self) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::new();
        let mut url = self.people_url.clone();

        for page in 0..MAX_PAGES {
            let body = self.transport.get_json(&url, &[]).await?;
            let people = body
                .pointer("/_embedded/osdi:people")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for person in people {
                records.push(person_to_record(person, &self.schema, &self.custom_fields)?);
            }
            debug!(page, count = people.len(), "fetched ActionNetwork page");

            match body.pointer("/_links/next/href").and_then(Value::as_str) {
                Some(next) => url = next.to_string(),
                None => return Ok(records),
            }
        }

        Err(StoreError::PageLimit(MAX_PAGES))
    }
}

#[async_trait]
impl Connection for ActionNetworkConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, FetchError> {
        self.fetch_pages()
            .await
            .map_err(|e| FetchError::new(&self.name, e))
    }

    async fn create(&self, record: &Record) -> Result<Record, WriteError> {
        let person = person_body(record.fields(), &self.custom_fields, &self.name)?;
        let body = json!({ "person": person });
        let created = self
            .transport
            .send_json(Method::POST, &self.people_url, &body)
            .await
            .map_err(|e| WriteError::store(&self.name, e))?;
        person_to_record(&created, &self.schema, &self.custom_fields)
            .map_err(|e| WriteError::store(&self.name, e))
    }

    async fn update(&self, id: &str, changes: &FieldChanges) -> Result<(), WriteError> {
        let body = Value::Object(person_body(changes, &self.custom_fields, &self.name)?);
        let url = format!("{}/{}", self.people_url, id);
        self.transport
            .send_json(Method::PUT, &url, &body)
            .await
            .map_err(|e| WriteError::store(&self.name, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire mapping
// ---------------------------------------------------------------------------

/// Pick the entry flagged `primary`, else the first.
fn primary(list: Option<&Value>) -> Option<&Value> {
    let items = list?.as_array()?;
    items
        .iter()
        .find(|item| item.get("primary").and_then(Value::as_bool) == Some(true))
        .or_else(|| items.first())
}

fn person_id(person: &Value) -> Option<String> {
    let ids = person.get("identifiers")?.as_array()?;
    let ids: Vec<&str> = ids.iter().filter_map(Value::as_str).collect();
    ids.iter()
        .find_map(|id| id.strip_prefix(ID_PREFIX))
        .or_else(|| ids.first().copied())
        .map(str::to_string)
}

/// Translate one OSDI person into a record.
pub(crate) fn person_to_record(
    person: &Value,
    schema: &RecordSchema,
    custom_fields: &BTreeMap<String, String>,
) -> Result<Record, StoreError> {
    if !person.is_object() {
        return Err(StoreError::Parse(format!(
            "expected an OSDI person object, got: {}",
            person
        )));
    }

    let email = primary(person.get("email_addresses"))
        .and_then(|e| e.get("address"))
        .unwrap_or(&Value::Null);
    let zip = primary(person.get("postal_addresses"))
        .and_then(|a| a.get("postal_code"))
        .unwrap_or(&Value::Null);
    let given = person.get("given_name").unwrap_or(&Value::Null);
    let family = person.get("family_name").unwrap_or(&Value::Null);

    let mut record = Record::new(Side::A)
        .with_field("email_address", schema.coerce("email_address", email))
        .with_field("first_name", schema.coerce("first_name", given))
        .with_field("last_name", schema.coerce("last_name", family))
        .with_field("zip_code", schema.coerce("zip_code", zip))
        .with_last_modified(
            person
                .get("modified_date")
                .and_then(Value::as_str)
                .and_then(parse_date),
        );

    let custom = person.get("custom_fields");
    for (field, key) in custom_fields {
        let raw = custom.and_then(|c| c.get(key)).unwrap_or(&Value::Null);
        record = record.with_field(field.as_str(), schema.coerce(field, raw));
    }

    if let Some(id) = person_id(person) {
        record = record.with_id(id);
    }
    Ok(record)
}

/// Build an OSDI person body carrying `fields`.
pub(crate) fn person_body(
    fields: &BTreeMap<String, FieldValue>,
    custom_fields: &BTreeMap<String, String>,
    store: &str,
) -> Result<Map<String, Value>, WriteError> {
    let mut person = Map::new();
    let mut custom = Map::new();

    for (field, value) in fields {
        let text = match value {
            FieldValue::Null => Value::String(String::new()),
            other => other.to_json(),
        };
        match field.as_str() {
            "email_address" => {
                person.insert("email_addresses".into(), json!([{ "address": text }]));
            }
            "first_name" => {
                person.insert("given_name".into(), text);
            }
            "last_name" => {
                person.insert("family_name".into(), text);
            }
            "zip_code" => {
                person.insert("postal_addresses".into(), json!([{ "postal_code": text }]));
            }
            other => match custom_fields.get(other) {
                Some(key) => {
                    custom.insert(key.clone(), text);
                }
                None => {
                    return Err(WriteError::UnsupportedField {
                        store: store.to_string(),
                        field: other.to_string(),
                        detail: "not a standard OSDI field and no custom field is mapped".into(),
                    })
                }
            },
        }
    }

    if !custom.is_empty() {
        person.insert("custom_fields".into(), Value::Object(custom));
    }
    Ok(person)
}
