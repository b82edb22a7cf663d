//! Concrete store adapters.
//!
//! Each adapter implements [`Connection`] over the store's HTTP API and
//! translates between the store's wire vocabulary and the normalized record
//! fields. The reconciliation core never names these types; callers build
//! them from configuration with [`build_connection`].

pub mod action_network;
pub mod airtable;
pub mod http;

use tracing::debug;

use crate::config::StoreConfig;
use crate::connection::Connection;
use crate::errors::{ConfigError, CoreError};
use crate::schema::RecordSchema;

pub use action_network::ActionNetworkConnection;
pub use airtable::AirtableConnection;

/// Build the connection described by `config`.
///
/// The store's token must have been resolved with
/// [`AppConfig::resolve_env_vars`](crate::config::AppConfig::resolve_env_vars).
pub fn build_connection(
    config: &StoreConfig,
    schema: &RecordSchema,
) -> Result<Box<dyn Connection>, CoreError> {
    let token = config.token().ok_or_else(|| ConfigError::EnvVarMissing {
        var: config.token_env().to_string(),
        field: format!("{}.token_env", config.name()),
    })?;
    debug!(store = config.name(), kind = config.kind(), "building connection");

    let conn: Box<dyn Connection> = match config {
        StoreConfig::ActionNetwork(c) => {
            Box::new(ActionNetworkConnection::new(c, token, schema.clone())?)
        }
        StoreConfig::Airtable(c) => Box::new(AirtableConnection::new(c, token, schema.clone())?),
    };
    Ok(conn)
}
