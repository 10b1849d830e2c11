//! Database migration runner.
//!
//! Fresh databases are created straight from the [`schema`](crate::schema)
//! registry.  Databases written by an older build are upgraded here, one step
//! per version, guarded by the `user_version` pragma.  The whole upgrade runs
//! in a single transaction so a failed step leaves the file untouched.

pub mod v002_channel_members;

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::schema::{self, SCHEMA_VERSION};

/// Upgrade a database currently at `from` to [`SCHEMA_VERSION`].
pub fn run_migrations(conn: &mut Connection, from: u32) -> Result<()> {
    tracing::info!(
        current_version = from,
        target_version = SCHEMA_VERSION,
        "applying database migrations"
    );

    let tx = conn.transaction()?;

    if from < 2 {
        tracing::info!("applying migration v002_channel_members");
        v002_channel_members::up(&tx).map_err(|e| StoreError::Migration(e.to_string()))?;
    }

    schema::write_identity(&tx)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{validate, ValidationResult};

    /// Keyring table as shipped by schema version 1.
    const V1_SQL: &str = "
        CREATE TABLE keyring (
            key_id                 TEXT NOT NULL,
            channel_name           TEXT NOT NULL,
            symmetric_key_material TEXT NOT NULL,
            created_at             INTEGER NOT NULL,
            is_active              INTEGER NOT NULL,
            PRIMARY KEY (key_id)
        );
        INSERT INTO keyring VALUES ('k1', 'Study Group', 'c2VjcmV0', 1700000000000, 1);
        PRAGMA user_version = 1;
    ";

    #[test]
    fn v1_upgrades_to_a_valid_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SQL).unwrap();

        run_migrations(&mut conn, 1).unwrap();

        assert_eq!(validate(&conn).unwrap(), ValidationResult::Valid);
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn existing_keys_get_default_cover_message() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SQL).unwrap();
        run_migrations(&mut conn, 1).unwrap();

        let (cover, group): (String, Option<String>) = conn
            .query_row(
                "SELECT cover_message, linked_group_name FROM keyring WHERE key_id = 'k1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(cover, crate::models::DEFAULT_COVER_MESSAGE);
        assert_eq!(group, None);
    }

    #[test]
    fn failed_step_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Already has the column the migration adds, so ALTER TABLE fails.
        conn.execute_batch(
            "CREATE TABLE keyring (key_id TEXT NOT NULL PRIMARY KEY, creator_uid TEXT);
             PRAGMA user_version = 1;",
        )
        .unwrap();

        let err = run_migrations(&mut conn, 1).unwrap_err();
        assert!(matches!(err, StoreError::Migration(_)));

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
        assert!(!schema::table_exists(&conn, "channel_members").unwrap());
    }
}
