//! Store connection capability trait.
//!
//! Every concrete store (ActionNetwork, Airtable, test fakes) implements
//! [`Connection`]. The reconciliation core depends only on this trait.
//!
//! Contract:
//! - `fetch_all` returns every record of the store, already translated to the
//!   normalized field vocabulary. Pagination, rate limiting and retries are
//!   the adapter's business.
//! - `create` stores a new record and returns it as stored (typically with a
//!   store-assigned identifier).
//! - `update` writes only the given fields to the record with `id`.
//!
//! Adapters are stateless between calls; the engine invokes each operation
//! once and never shares mutable state across connections.

use async_trait::async_trait;

use crate::errors::{FetchError, WriteError};
use crate::record::{FieldChanges, Record};

#[async_trait]
pub trait Connection: Send + Sync {
    /// Display name of the store (used in logs and the run summary).
    fn name(&self) -> &str;

    /// Fetch the full record set.
    async fn fetch_all(&self) -> Result<Vec<Record>, FetchError>;

    /// Create a record, returning the stored copy.
    async fn create(&self, record: &Record) -> Result<Record, WriteError>;

    /// Write `changes` to the record identified by `id`.
    async fn update(&self, id: &str, changes: &FieldChanges) -> Result<(), WriteError>;
}
