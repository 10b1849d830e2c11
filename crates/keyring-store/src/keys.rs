//! Operations on [`ChannelKey`] records.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::database::Database;
use crate::error::Result;
use crate::live::LiveQuery;
use crate::models::{millis_to_datetime, ChannelKey};
use crate::schema::Table;
use crate::statements::{StatementCache, WriteStatement};

pub(crate) const KEY_COLUMNS: &str = "key_id, channel_name, symmetric_key_material, created_at, \
     is_active, linked_group_name, cover_message, creator_uid";

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a key, replacing any existing row with the same `key_id`
    /// in full.
    pub fn insert_key(&self, key: &ChannelKey) -> Result<()> {
        self.write(&[Table::Keyring], |tx, statements| {
            insert_key_row(tx, statements, key)
        })
    }

    /// Soft-delete a key.  Returns whether a row matched.
    pub fn deactivate_key(&self, key_id: &str) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::DeactivateKey)?;
            Ok(stmt.execute(params![key_id])? > 0)
        })
    }

    /// Remove a key row for good.
    ///
    /// Members of the channel are left in place; use
    /// [`purge_channel`](Self::purge_channel) to remove both.
    pub fn delete_key(&self, key_id: &str) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::DeleteKey)?;
            Ok(stmt.execute(params![key_id])? > 0)
        })
    }

    pub fn update_cover_message(&self, key_id: &str, cover_message: &str) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::UpdateCoverMessage)?;
            Ok(stmt.execute(params![key_id, cover_message])? > 0)
        })
    }

    /// Attach the channel to a messaging group, or detach it with `None`.
    pub fn update_linked_group(&self, key_id: &str, group_name: Option<&str>) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::UpdateLinkedGroup)?;
            Ok(stmt.execute(params![key_id, group_name])? > 0)
        })
    }

    pub fn rename_channel(&self, key_id: &str, new_name: &str) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::RenameChannel)?;
            Ok(stmt.execute(params![key_id, new_name])? > 0)
        })
    }

    /// Deactivate `old_key_id` and insert `new_key` atomically.
    pub fn rotate_key(&self, old_key_id: &str, new_key: &ChannelKey) -> Result<()> {
        self.write(&[Table::Keyring], |tx, statements| {
            {
                let mut stmt = statements.acquire(tx, WriteStatement::DeactivateKey)?;
                stmt.execute(params![old_key_id])?;
            }
            insert_key_row(tx, statements, new_key)
        })
    }

    /// Deactivate an active key on behalf of `current_uid`.
    ///
    /// Refused (returns `false`) when the key records a creator other than
    /// `current_uid`.  Keys without a recorded creator can be dissolved by
    /// anyone.  Returns `false` as well when no active key matches.
    pub fn dissolve_channel(&self, key_id: &str, current_uid: &str) -> Result<bool> {
        self.write(&[Table::Keyring], |tx, statements| {
            let creator: Option<Option<String>> = tx
                .query_row(
                    "SELECT creator_uid FROM keyring WHERE key_id = ?1 AND is_active = 1",
                    params![key_id],
                    |row| row.get(0),
                )
                .optional()?;

            match creator {
                None => Ok(false),
                Some(Some(creator)) if creator != current_uid => {
                    tracing::warn!(key_id, "dissolve refused: caller is not the channel creator");
                    Ok(false)
                }
                Some(_) => {
                    let mut stmt = statements.acquire(tx, WriteStatement::DeactivateKey)?;
                    Ok(stmt.execute(params![key_id])? > 0)
                }
            }
        })
    }

    /// Delete a channel's members and then its key, in one transaction.
    /// Returns the number of members removed.
    pub fn purge_channel(&self, key_id: &str) -> Result<usize> {
        self.write(&Table::ALL, |tx, statements| {
            let removed = {
                let mut stmt = statements.acquire(tx, WriteStatement::DeleteAllMembers)?;
                stmt.execute(params![key_id])?
            };
            let mut stmt = statements.acquire(tx, WriteStatement::DeleteKey)?;
            stmt.execute(params![key_id])?;
            Ok(removed)
        })
    }

    // ------------------------------------------------------------------
    // One-shot reads
    // ------------------------------------------------------------------

    /// Active key with the given id.  Used to pick the key for decryption.
    pub fn get_by_key_id(&self, key_id: &str) -> Result<Option<ChannelKey>> {
        self.read(|conn| {
            let key = conn
                .query_row(
                    &format!(
                        "SELECT {KEY_COLUMNS} FROM keyring
                         WHERE key_id = ?1 AND is_active = 1
                         LIMIT 1"
                    ),
                    params![key_id],
                    row_to_key,
                )
                .optional()?;
            Ok(key)
        })
    }

    /// Active key with the given channel name.
    pub fn get_by_channel_name(&self, channel_name: &str) -> Result<Option<ChannelKey>> {
        self.read(|conn| {
            let key = conn
                .query_row(
                    &format!(
                        "SELECT {KEY_COLUMNS} FROM keyring
                         WHERE channel_name = ?1 AND is_active = 1
                         LIMIT 1"
                    ),
                    params![channel_name],
                    row_to_key,
                )
                .optional()?;
            Ok(key)
        })
    }

    /// Every active key, in storage order.
    pub fn get_all_active_keys_list(&self) -> Result<Vec<ChannelKey>> {
        self.read(|conn| {
            query_keys(
                conn,
                &format!("SELECT {KEY_COLUMNS} FROM keyring WHERE is_active = 1"),
                [],
            )
        })
    }

    /// Active keys linked to `group_name`, newest first.
    pub fn get_by_group_name(&self, group_name: &str) -> Result<Vec<ChannelKey>> {
        self.read(|conn| keys_for_group(conn, group_name))
    }

    /// Every key, active or not, newest first.
    pub fn get_all_keys(&self) -> Result<Vec<ChannelKey>> {
        self.read(all_keys)
    }

    pub fn get_active_channel_count(&self) -> Result<u32> {
        self.read(active_channel_count)
    }

    /// Whether an active channel already uses `channel_name`.
    pub fn channel_name_exists(&self, channel_name: &str) -> Result<bool> {
        self.read(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM keyring WHERE channel_name = ?1 AND is_active = 1)",
                params![channel_name],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    // ------------------------------------------------------------------
    // Continuous reads
    // ------------------------------------------------------------------

    /// Active keys, newest first.
    pub fn all_active_keys(&self) -> LiveQuery<Vec<ChannelKey>> {
        self.live("all_active_keys", &[Table::Keyring], |conn| {
            query_keys(
                conn,
                &format!(
                    "SELECT {KEY_COLUMNS} FROM keyring
                     WHERE is_active = 1
                     ORDER BY created_at DESC"
                ),
                [],
            )
        })
    }

    /// Every key, newest first.
    pub fn all_keys(&self) -> LiveQuery<Vec<ChannelKey>> {
        self.live("all_keys", &[Table::Keyring], all_keys)
    }

    pub fn active_channel_count(&self) -> LiveQuery<u32> {
        self.live("active_channel_count", &[Table::Keyring], active_channel_count)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn insert_key_row(
    conn: &Connection,
    statements: &StatementCache,
    key: &ChannelKey,
) -> Result<()> {
    let mut stmt = statements.acquire(conn, WriteStatement::InsertKey)?;
    stmt.execute(params![
        key.key_id,
        key.channel_name,
        key.symmetric_key_material,
        key.created_at.timestamp_millis(),
        key.is_active,
        key.linked_group_name,
        key.cover_message,
        key.creator_uid,
    ])?;
    Ok(())
}

pub(crate) fn query_keys<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ChannelKey>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, row_to_key)?;

    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

pub(crate) fn keys_for_group(conn: &Connection, group_name: &str) -> Result<Vec<ChannelKey>> {
    query_keys(
        conn,
        &format!(
            "SELECT {KEY_COLUMNS} FROM keyring
             WHERE linked_group_name = ?1 AND is_active = 1
             ORDER BY created_at DESC"
        ),
        params![group_name],
    )
}

fn all_keys(conn: &Connection) -> Result<Vec<ChannelKey>> {
    query_keys(
        conn,
        &format!("SELECT {KEY_COLUMNS} FROM keyring ORDER BY created_at DESC"),
        [],
    )
}

fn active_channel_count(conn: &Connection) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM keyring WHERE is_active = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Map a row selected with [`KEY_COLUMNS`] into a [`ChannelKey`].
pub(crate) fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ChannelKey> {
    Ok(ChannelKey {
        key_id: row.get(0)?,
        channel_name: row.get(1)?,
        symmetric_key_material: row.get(2)?,
        created_at: millis_to_datetime(3, row.get(3)?)?,
        is_active: row.get(4)?,
        linked_group_name: row.get(5)?,
        cover_message: row.get(6)?,
        creator_uid: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::DEFAULT_COVER_MESSAGE;
    use crate::test_support::{key, member, open_temp};
    use chrono::{Duration, Utc};

    #[test]
    fn insert_and_get_by_key_id() {
        let (_dir, db) = open_temp();
        let k = key("a1b2c3d4", "Study Group")
            .with_linked_group("Family")
            .with_creator("uid-7");
        db.insert_key(&k).unwrap();

        let fetched = db.get_by_key_id("a1b2c3d4").unwrap().unwrap();
        assert_eq!(fetched, k);
        assert_eq!(fetched.cover_message, DEFAULT_COVER_MESSAGE);
    }

    #[test]
    fn missing_key_is_none() {
        let (_dir, db) = open_temp();
        assert!(db.get_by_key_id("nope").unwrap().is_none());
        assert!(db.get_by_channel_name("nope").unwrap().is_none());
    }

    #[test]
    fn insert_with_same_id_replaces_whole_row() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "First").with_linked_group("G"))
            .unwrap();
        db.insert_key(&key("k1", "Second")).unwrap();

        let all = db.get_all_keys().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].channel_name, "Second");
        // Replaced, not merged.
        assert_eq!(all[0].linked_group_name, None);
    }

    #[test]
    fn deactivated_key_is_hidden_but_kept() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        assert!(db.deactivate_key("k1").unwrap());
        assert!(db.get_by_key_id("k1").unwrap().is_none());
        assert!(db.get_all_active_keys_list().unwrap().is_empty());

        let all = db.get_all_keys().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);
    }

    #[test]
    fn point_updates_report_matches() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        assert!(db.update_cover_message("k1", "See you at 5").unwrap());
        assert!(db.update_linked_group("k1", Some("Neighbours")).unwrap());
        assert!(db.rename_channel("k1", "Beta").unwrap());
        assert!(!db.rename_channel("missing", "Gamma").unwrap());

        let k1 = db.get_by_key_id("k1").unwrap().unwrap();
        assert_eq!(k1.cover_message, "See you at 5");
        assert_eq!(k1.linked_group_name.as_deref(), Some("Neighbours"));
        assert_eq!(k1.channel_name, "Beta");

        assert!(db.update_linked_group("k1", None).unwrap());
        assert_eq!(
            db.get_by_key_id("k1").unwrap().unwrap().linked_group_name,
            None
        );
    }

    #[test]
    fn delete_key_does_not_cascade() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();
        db.insert_members(&[member("k1", "Ana", "+100"), member("k1", "Ben", "+200")])
            .unwrap();

        assert!(db.delete_key("k1").unwrap());
        assert!(db.get_all_keys().unwrap().is_empty());
        assert_eq!(db.get_members_for_channel_list("k1").unwrap().len(), 2);
    }

    #[test]
    fn purge_channel_removes_members_and_key() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();
        db.insert_key(&key("k2", "Beta")).unwrap();
        db.insert_members(&[member("k1", "Ana", "+100"), member("k2", "Ben", "+200")])
            .unwrap();

        assert_eq!(db.purge_channel("k1").unwrap(), 1);
        assert!(db.get_members_for_channel_list("k1").unwrap().is_empty());
        assert_eq!(db.get_all_keys().unwrap().len(), 1);
        assert_eq!(db.get_member_count("k2").unwrap(), 1);
    }

    #[test]
    fn rotate_key_swaps_active_key() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("old", "Alpha")).unwrap();
        db.rotate_key("old", &key("new", "Alpha")).unwrap();

        assert!(db.get_by_key_id("old").unwrap().is_none());
        assert_eq!(
            db.get_by_channel_name("Alpha").unwrap().unwrap().key_id,
            "new"
        );
        assert_eq!(db.get_active_channel_count().unwrap(), 1);
        assert_eq!(db.get_all_keys().unwrap().len(), 2);
    }

    #[test]
    fn creator_can_dissolve_channel() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha").with_creator("uid-1")).unwrap();

        assert!(db.dissolve_channel("k1", "uid-1").unwrap());
        assert!(db.get_by_key_id("k1").unwrap().is_none());
        assert!(!db.get_all_keys().unwrap()[0].is_active);
        assert!(!db.dissolve_channel("k1", "uid-1").unwrap());
    }

    #[test]
    fn other_user_cannot_dissolve_channel() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha").with_creator("uid-1")).unwrap();

        assert!(!db.dissolve_channel("k1", "uid-2").unwrap());
        assert!(db.get_by_key_id("k1").unwrap().unwrap().is_active);
    }

    #[test]
    fn channel_without_creator_can_be_dissolved_by_anyone() {
        let (_dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        assert!(db.dissolve_channel("k1", "uid-9").unwrap());
        assert!(db.get_by_key_id("k1").unwrap().is_none());
        assert!(!db.dissolve_channel("missing", "uid-9").unwrap());
    }

    #[test]
    fn group_and_name_lookups() {
        let (_dir, db) = open_temp();
        let now = Utc::now();
        db.insert_key(
            &key("k1", "Older")
                .with_linked_group("Family")
                .with_created_at(now - Duration::hours(1)),
        )
        .unwrap();
        db.insert_key(&key("k2", "Newer").with_linked_group("Family").with_created_at(now))
            .unwrap();
        db.insert_key(&key("k3", "Other").with_linked_group("Work"))
            .unwrap();
        db.insert_key(&key("k4", "Gone").with_linked_group("Family"))
            .unwrap();
        db.deactivate_key("k4").unwrap();

        let ids: Vec<String> = db
            .get_by_group_name("Family")
            .unwrap()
            .into_iter()
            .map(|k| k.key_id)
            .collect();
        assert_eq!(ids, vec!["k2", "k1"]);

        assert!(db.channel_name_exists("Other").unwrap());
        assert!(!db.channel_name_exists("Gone").unwrap());
    }

    #[test]
    fn out_of_range_timestamp_is_a_decoding_error() {
        let (dir, db) = open_temp();
        db.insert_key(&key("k1", "Alpha")).unwrap();

        let raw = Connection::open(dir.path().join("keyring.db")).unwrap();
        raw.execute("UPDATE keyring SET created_at = ?1", params![i64::MAX])
            .unwrap();
        drop(raw);

        let err = db.get_all_keys().unwrap_err();
        assert!(matches!(err, StoreError::Decoding { column: 3, .. }), "{err:?}");
    }
}
