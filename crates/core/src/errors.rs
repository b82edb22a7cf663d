//! Error types for the RosterSync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Note that duplicate identities and unresolved field conflicts are *not*
//! errors: they are data-quality conditions reported in the
//! [`RunSummary`](crate::summary::RunSummary).

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Store transport errors
// ---------------------------------------------------------------------------

/// Transport-level failures talking to a store's HTTP API.
///
/// These are wrapped by [`FetchError`] or [`WriteError`] depending on which
/// operation was in flight.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// Credentials were rejected.
    #[error("authentication failed (HTTP {status})")]
    AuthenticationFailed { status: u16 },

    /// The store asked us to slow down.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The response body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    Parse(String),

    /// The listing kept returning "next page" links past the safety limit.
    #[error("pagination exceeded {0} pages")]
    PageLimit(usize),

    /// All retry attempts failed; carries the last error.
    #[error("request to {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last: Box<StoreError>,
    },
}

// ---------------------------------------------------------------------------
// Fetch errors
// ---------------------------------------------------------------------------

/// A full-listing fetch from one store failed. Fatal to the run.
#[derive(Debug, Error)]
#[error("failed to fetch records from {store}: {source}")]
pub struct FetchError {
    /// Display name of the store.
    pub store: String,
    #[source]
    pub source: StoreError,
}

impl FetchError {
    pub fn new(store: impl Into<String>, source: StoreError) -> Self {
        Self {
            store: store.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Write errors
// ---------------------------------------------------------------------------

/// A single create or update call failed. Isolated to that record.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The store rejected or failed the write.
    #[error("{store} write failed: {source}")]
    Store {
        store: String,
        #[source]
        source: StoreError,
    },

    /// The record carries no store identifier, so it cannot be updated.
    #[error("record has no {store} identifier to update")]
    MissingIdentifier { store: String },

    /// A field value cannot be expressed in the store's vocabulary.
    #[error("field '{field}' cannot be written to {store}: {detail}")]
    UnsupportedField {
        store: String,
        field: String,
        detail: String,
    },
}

impl WriteError {
    pub fn store(store: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            store: store.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite run-history store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A stored summary could not be (de)serialized.
    #[error("run summary serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
