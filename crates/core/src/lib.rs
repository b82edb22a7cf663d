//! RosterSync core library.
//!
//! This crate provides the reconciliation engine that keeps two member
//! stores in agreement: the store-agnostic record model, equivalence
//! matching, field-level resolution, the sync engine, concrete store
//! adapters, configuration, and run-history persistence.

pub mod config;
pub mod connection;
pub mod db;
pub mod errors;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod stores;
pub mod summary;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use connection::Connection;
pub use db::Database;
pub use record::{FieldChanges, FieldValue, Record, Side};
pub use summary::{RunStatus, RunSummary};
pub use sync_engine::{ReconcileSettings, SyncDirection, SyncEngine};
