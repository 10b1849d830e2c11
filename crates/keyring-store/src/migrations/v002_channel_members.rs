//! v002 -- group channel metadata and the `channel_members` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 1 to version 2.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Keyring: group linkage, cover text, creator
-- ----------------------------------------------------------------
ALTER TABLE keyring ADD COLUMN linked_group_name TEXT DEFAULT NULL;
ALTER TABLE keyring ADD COLUMN cover_message TEXT NOT NULL DEFAULT 'Noted 👍';
ALTER TABLE keyring ADD COLUMN creator_uid TEXT DEFAULT NULL;

-- ----------------------------------------------------------------
-- Channel members
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channel_members (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    channel_key_id      TEXT NOT NULL,              -- keyring(key_id), not enforced
    contact_name        TEXT NOT NULL,
    phone_number        TEXT NOT NULL,
    role                TEXT NOT NULL DEFAULT 'MEMBER',
    has_key             INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    contact_source      TEXT NOT NULL DEFAULT 'MANUAL',
    key_delivery_status TEXT NOT NULL DEFAULT 'PENDING',
    added_at            INTEGER NOT NULL DEFAULT 0  -- epoch millis
);

CREATE INDEX IF NOT EXISTS index_channel_members_channel_key_id
    ON channel_members (channel_key_id);
CREATE UNIQUE INDEX IF NOT EXISTS index_channel_members_channel_key_id_phone_number
    ON channel_members (channel_key_id, phone_number);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
