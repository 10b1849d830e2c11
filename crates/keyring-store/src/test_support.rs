//! Fixtures shared by the unit tests.

use tempfile::TempDir;

use crate::config::StoreConfig;
use crate::database::Database;
use crate::models::{ChannelKey, ChannelMember};

/// A store in a fresh temporary directory, at `<dir>/keyring.db`.
/// Subscriptions re-run without delay.
pub(crate) fn open_temp() -> (TempDir, Database) {
    open_temp_with(StoreConfig::default().with_coalesce_window(std::time::Duration::ZERO))
}

pub(crate) fn open_temp_with(config: StoreConfig) -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open_at(&dir.path().join("keyring.db"), config).expect("open store");
    (dir, db)
}

pub(crate) fn key(key_id: &str, channel_name: &str) -> ChannelKey {
    ChannelKey::new(key_id, channel_name, "c2VjcmV0LWtleS1tYXRlcmlhbA==")
}

pub(crate) fn member(channel_key_id: &str, contact_name: &str, phone_number: &str) -> ChannelMember {
    ChannelMember::new(channel_key_id, contact_name, phone_number)
}
