use thiserror::Error;

use crate::models::DecodeError;
use crate::statements::WriteStatement;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite / SQLCipher error that is not one of the typed cases below.
    /// Any failure inside a write transaction rolls it back.
    #[error("Database error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// A write would violate a uniqueness or NOT NULL constraint.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stored value does not decode into its Rust type (data corruption).
    #[error("Corrupt value in column {column}: {source}")]
    Decoding {
        column: usize,
        #[source]
        source: DecodeError,
    },

    /// The on-disk schema does not match the registry.  Fatal at open.
    #[error("Schema validation failed:\n{0}")]
    Validation(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The database was written by a newer build.
    #[error("Unsupported schema version {found} (this build supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// A prepared write statement was acquired while already leased.
    #[error("Statement {0:?} is already in use")]
    StatementBusy(WriteStatement),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No reader connection could be checked out within the busy timeout,
    /// or a new reader failed to open.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The configured location is not a database file on disk.
    #[error("Unsupported database location: {0}")]
    UnsupportedLocation(String),

    /// A connection mutex was poisoned by a panicking holder.
    #[error("Connection lock poisoned")]
    LockPoisoned,

    /// A background query task panicked or was cancelled.
    #[error("Query task failed: {0}")]
    Task(String),

    /// Backup payload (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(msg.unwrap_or_else(|| e.to_string()))
            }
            rusqlite::Error::FromSqlConversionFailure(column, ty, source) => {
                match source.downcast::<DecodeError>() {
                    Ok(decode) => StoreError::Decoding {
                        column,
                        source: *decode,
                    },
                    Err(source) => StoreError::Sqlite(
                        rusqlite::Error::FromSqlConversionFailure(column, ty, source),
                    ),
                }
            }
            other => StoreError::Sqlite(other),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
