//! Read-only connection pool.
//!
//! The database runs in WAL mode, so a read-only connection sees the last
//! committed snapshot even while the writer holds an open transaction.
//! Connections are opened on demand by r2d2 up to `max_readers`; a checkout
//! that cannot be served within the busy timeout fails with
//! [`StoreError::Pool`](crate::StoreError::Pool).

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::error::Result;

pub(crate) type PooledReader = PooledConnection<SqliteConnectionManager>;

/// Pool of read-only connections to one database file.  Cloning is cheap.
#[derive(Clone)]
pub(crate) struct ReaderPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReaderPool {
    pub(crate) fn new(
        path: &Path,
        max_readers: usize,
        busy_timeout: Duration,
        cipher_key: Option<String>,
    ) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);

        let max_size = u32::try_from(max_readers.max(1)).unwrap_or(u32::MAX);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(busy_timeout)
            .connection_customizer(Box::new(ReaderConnectionCustomizer {
                busy_timeout,
                cipher_key,
            }))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Borrow a connection for the duration of one operation.
    pub(crate) fn checkout(&self) -> Result<PooledReader> {
        Ok(self.pool.get()?)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> r2d2::State {
        self.pool.state()
    }
}

/// Keys each new reader and sets its busy timeout.
struct ReaderConnectionCustomizer {
    busy_timeout: Duration,
    cipher_key: Option<String>,
}

impl std::fmt::Debug for ReaderConnectionCustomizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderConnectionCustomizer")
            .field("busy_timeout", &self.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for ReaderConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
        crate::database::apply_cipher_key(conn, self.cipher_key.as_deref())?;
        conn.busy_timeout(self.busy_timeout)?;
        tracing::debug!("opened reader connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use rusqlite::Connection;

    fn pool(max: usize, timeout: Duration) -> (tempfile::TempDir, ReaderPool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA journal_mode = WAL; CREATE TABLE t (x INTEGER);")
            .unwrap();
        drop(conn);
        let pool = ReaderPool::new(&path, max, timeout, None).unwrap();
        (dir, pool)
    }

    #[test]
    fn connections_are_opened_lazily_and_reused() {
        let (_dir, pool) = pool(2, Duration::from_secs(1));
        assert_eq!(pool.state().connections, 0);

        {
            let conn = pool.checkout().unwrap();
            let n: i64 = conn
                .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0);
        }
        let _again = pool.checkout().unwrap();
        assert_eq!(pool.state().connections, 1);
    }

    #[test]
    fn readers_cannot_write() {
        let (_dir, pool) = pool(1, Duration::from_secs(1));
        let conn = pool.checkout().unwrap();
        assert!(conn.execute("INSERT INTO t (x) VALUES (1)", []).is_err());
    }

    #[test]
    fn readers_get_the_busy_timeout() {
        let (_dir, pool) = pool(1, Duration::from_millis(1_234));
        let conn = pool.checkout().unwrap();
        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |r| r.get(0))
            .unwrap();
        assert_eq!(timeout, 1_234);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (_dir, pool) = pool(1, Duration::from_millis(100));
        let held = pool.checkout().unwrap();

        let err = pool.checkout().err().expect("second checkout should time out");
        assert!(matches!(err, StoreError::Pool(_)), "{err:?}");

        drop(held);
        assert!(pool.checkout().is_ok());
    }
}
