//! Store configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the store can be opened with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Database file location.
    /// Env: `KEYRING_DB_PATH`
    /// Default: `None` (platform data directory, see [`Database::new`]).
    ///
    /// [`Database::new`]: crate::Database::new
    pub db_path: Option<PathBuf>,

    /// Maximum number of read-only connections kept open for queries.
    /// Env: `KEYRING_MAX_READERS`
    /// Default: `4`
    pub max_readers: usize,

    /// How long a connection waits on a locked database before failing.
    /// Env: `KEYRING_BUSY_TIMEOUT_MS`
    /// Default: 5 s
    pub busy_timeout: Duration,

    /// Delay between a subscription being invalidated and its query
    /// re-running, so bursts of commits are read once.
    /// Env: `KEYRING_COALESCE_MS`
    /// Default: 16 ms
    pub coalesce_window: Duration,

    /// SQLCipher passphrase.  Only honoured with the `sqlcipher` feature.
    /// Env: `KEYRING_CIPHER_KEY`
    /// Default: `None`
    pub cipher_key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_readers: 4,
            busy_timeout: Duration::from_millis(5_000),
            coalesce_window: Duration::from_millis(16),
            cipher_key: None,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("db_path", &self.db_path)
            .field("max_readers", &self.max_readers)
            .field("busy_timeout", &self.busy_timeout)
            .field("coalesce_window", &self.coalesce_window)
            .field("cipher_key", &self.cipher_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("KEYRING_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("KEYRING_MAX_READERS") {
            match parse_max_readers(&val) {
                Some(n) => config.max_readers = n,
                None => tracing::warn!(value = %val, "Invalid KEYRING_MAX_READERS, using default"),
            }
        }

        if let Ok(val) = std::env::var("KEYRING_BUSY_TIMEOUT_MS") {
            match parse_millis(&val) {
                Some(d) => config.busy_timeout = d,
                None => {
                    tracing::warn!(value = %val, "Invalid KEYRING_BUSY_TIMEOUT_MS, using default")
                }
            }
        }

        if let Ok(val) = std::env::var("KEYRING_COALESCE_MS") {
            match parse_millis(&val) {
                Some(d) => config.coalesce_window = d,
                None => tracing::warn!(value = %val, "Invalid KEYRING_COALESCE_MS, using default"),
            }
        }

        if let Ok(key) = std::env::var("KEYRING_CIPHER_KEY") {
            if !key.is_empty() {
                config.cipher_key = Some(key);
            }
        }

        config
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }
}

fn parse_millis(val: &str) -> Option<Duration> {
    val.trim().parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_max_readers(val: &str) -> Option<usize> {
    val.trim().parse::<usize>().ok().filter(|n| *n > 0)
}
