//! Database connection management.
//!
//! A [`Database`] owns one writer connection and a small pool of read-only
//! connections to the same WAL-mode file.  Opening a database creates or
//! migrates the schema and then validates it against the registry; a store
//! whose on-disk shape does not match is never handed out.
//!
//! All mutations funnel through [`Database::write`], which runs them in an
//! `IMMEDIATE` transaction and reports the touched tables to the
//! [`InvalidationTracker`] only after the commit succeeded.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use directories::ProjectDirs;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::invalidation::InvalidationTracker;
use crate::live::LiveQuery;
use crate::migrations;
use crate::pool::ReaderPool;
use crate::schema::{self, Table, ValidationResult, SCHEMA_VERSION};
use crate::statements::StatementCache;

struct Writer {
    conn: Connection,
    statements: StatementCache,
}

/// Handle to an open keyring store.
///
/// There is one `Database` per file; share it behind an `Arc` rather than
/// opening the same path twice, since change notifications are local to the
/// handle.
pub struct Database {
    writer: Mutex<Writer>,
    readers: ReaderPool,
    tracker: InvalidationTracker,
    path: PathBuf,
    config: StoreConfig,
}

impl Database {
    /// Open (or create) the store described by `config`.
    ///
    /// Without an explicit `db_path` the file is placed in the platform data
    /// directory:
    /// - Linux:   `~/.local/share/keyring/keyring.db`
    /// - macOS:   `~/Library/Application Support/com.keyring.keyring/keyring.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\keyring\keyring\data\keyring.db`
    pub fn new(config: StoreConfig) -> Result<Self> {
        let path = match &config.db_path {
            Some(path) => path.clone(),
            None => {
                let project_dirs =
                    ProjectDirs::from("com", "keyring", "keyring").ok_or(StoreError::NoDataDir)?;
                project_dirs.data_dir().join("keyring.db")
            }
        };

        Self::open_at(&path, config)
    }

    /// Open (or create) a store at an explicit path.
    ///
    /// `path` must name a file on disk.  In-memory databases and `file:` URIs
    /// are rejected: the reader pool opens its own connections to the same
    /// path, which would each see a separate empty database.
    pub fn open_at(path: &Path, config: StoreConfig) -> Result<Self> {
        check_location(path)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "opening keyring database");

        let mut conn = Connection::open(path)?;
        apply_cipher_key(&conn, config.cipher_key.as_deref())?;
        conn.busy_timeout(config.busy_timeout)?;

        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal, "WAL unavailable; readers may block on writes");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.set_prepared_statement_cache_capacity(StatementCache::capacity());

        prepare_schema(&mut conn)?;

        let readers = ReaderPool::new(
            path,
            config.max_readers,
            config.busy_timeout,
            config.cipher_key.clone(),
        )?;

        Ok(Self {
            writer: Mutex::new(Writer {
                conn,
                statements: StatementCache::new(),
            }),
            readers,
            tracker: InvalidationTracker::new(),
            path: path.to_path_buf(),
            config,
        })
    }

    /// Filesystem path of the open database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The change bus fed by this handle's writes.
    pub fn tracker(&self) -> &InvalidationTracker {
        &self.tracker
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.read(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
    }

    // ------------------------------------------------------------------
    // Transactional writer
    // ------------------------------------------------------------------

    /// Run `op` inside one `IMMEDIATE` transaction on the writer connection.
    ///
    /// The transaction commits only if `op` returns `Ok`; any error (or a
    /// panic) rolls it back.  `tables` is reported to the tracker after a
    /// successful commit and never otherwise.
    pub(crate) fn write<R>(
        &self,
        tables: &[Table],
        op: impl FnOnce(&Transaction<'_>, &StatementCache) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.writer.lock()?;
        let Writer { conn, statements } = &mut *guard;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = op(&tx, statements)?;
        tx.commit()?;
        drop(guard);

        debug!(?tables, "committed write");
        self.tracker.record_write(tables);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Query executor
    // ------------------------------------------------------------------

    /// Run a one-shot read on a pooled read-only connection.
    pub(crate) fn read<R>(&self, op: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.readers.checkout()?;
        op(&*conn)
    }

    /// Like [`read`](Self::read), but every statement `op` runs sees the same
    /// committed snapshot.
    pub(crate) fn read_snapshot<R>(&self, op: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.readers.checkout()?;
        let tx = conn.unchecked_transaction()?;
        let out = op(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Build a continuous query over `tables`.
    pub(crate) fn live<T, F>(&self, label: &'static str, tables: &[Table], query: F) -> LiveQuery<T>
    where
        T: Send + 'static,
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
    {
        LiveQuery::new(
            label,
            tables,
            self.readers.clone(),
            self.tracker.clone(),
            self.config.coalesce_window,
            query,
        )
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Delete every key and member, then checkpoint the WAL and compact the
    /// file.
    ///
    /// Blocks for as long as `VACUUM` takes; call it from a background
    /// thread (e.g. `spawn_blocking`), not from a latency-sensitive path.
    pub fn clear_all(&self) -> Result<()> {
        let mut guard = self.writer.lock()?;
        let conn = &mut guard.conn;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let members = tx.execute("DELETE FROM channel_members", [])?;
        let keys = tx.execute("DELETE FROM keyring", [])?;
        tx.commit()?;
        self.tracker.record_write(&Table::ALL);

        info!(keys, members, "cleared keyring store");

        if conn.is_autocommit() {
            conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
            conn.execute_batch("VACUUM")?;
            debug!("checkpointed and vacuumed");
        } else {
            warn!("writer inside a transaction; skipping compaction");
        }

        Ok(())
    }
}

/// Reject locations that SQLite would not resolve to one shared file.
fn check_location(path: &Path) -> Result<()> {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == ":memory:" || trimmed.starts_with("file:") {
        return Err(StoreError::UnsupportedLocation(raw.into_owned()));
    }
    Ok(())
}

/// Key a freshly opened connection.  A no-op without the `sqlcipher` feature.
#[cfg(feature = "sqlcipher")]
pub(crate) fn apply_cipher_key(conn: &Connection, key: Option<&str>) -> rusqlite::Result<()> {
    if let Some(key) = key {
        conn.pragma_update(None, "key", key)?;
    }
    Ok(())
}

#[cfg(not(feature = "sqlcipher"))]
pub(crate) fn apply_cipher_key(_conn: &Connection, key: Option<&str>) -> rusqlite::Result<()> {
    if key.is_some() {
        warn!("cipher key configured but built without `sqlcipher`; ignoring it");
    }
    Ok(())
}

/// Bring the schema to [`SCHEMA_VERSION`] and validate it.
fn prepare_schema(conn: &mut Connection) -> Result<()> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    if version == 0 && !schema::table_exists(conn, Table::Keyring.name())? {
        info!(version = SCHEMA_VERSION, "creating schema");
        let tx = conn.transaction()?;
        schema::create_all(&tx)?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
    } else if version > 0 && version < SCHEMA_VERSION {
        migrations::run_migrations(conn, version)?;
    }

    match schema::validate(conn)? {
        ValidationResult::Valid => Ok(()),
        mismatch => {
            let diff = mismatch.describe();
            error!(%diff, "schema validation failed");
            Err(StoreError::Validation(diff))
        }
    }
}
