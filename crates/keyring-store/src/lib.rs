//! # keyring-store
//!
//! Local storage for channel encryption keys and the contacts each key has
//! been delivered to, backed by SQLite (optionally SQLCipher).
//!
//! The crate exposes a synchronous [`Database`] handle with typed writes and
//! one-shot reads for both tables, plus [`LiveQuery`] subscriptions that
//! re-emit their result whenever a committed write changes it.  Every write
//! is a single transaction; subscribers only ever see committed state.

pub mod backup;
pub mod config;
pub mod database;
pub mod invalidation;
pub mod keys;
pub mod live;
pub mod members;
pub mod migrations;
pub mod models;
pub mod schema;
pub mod statements;

mod error;
mod pool;

#[cfg(test)]
mod test_support;

pub use backup::{BackupPayload, ImportStats};
pub use config::StoreConfig;
pub use database::Database;
pub use error::{Result, StoreError};
pub use invalidation::{InvalidationTracker, Registration};
pub use live::{LiveQuery, Subscription};
pub use models::*;
pub use schema::{SchemaDiff, Table, ValidationResult};
pub use statements::{StatementCache, StatementLease, WriteStatement};
