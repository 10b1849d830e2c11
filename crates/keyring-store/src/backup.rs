use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::Result;
use crate::keys::{insert_key_row, query_keys, KEY_COLUMNS};
use crate::members::{insert_member_row, members_for_channel};
use crate::models::{ChannelKey, ChannelMember};
use crate::schema::Table;
use crate::statements::WriteStatement;

/// Keyring backup: every active key and its members.  Serialized to JSON and
/// encrypted by the caller before it leaves the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Crate version that produced the backup
    pub version: String,
    pub keys: Vec<ChannelKey>,
    pub members: Vec<ChannelMember>,
}

impl BackupPayload {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStats {
    pub keys_imported: usize,
    pub members_imported: usize,
}

impl Database {
    /// Export active keys and their members from one consistent snapshot.
    pub fn export_backup(&self) -> Result<BackupPayload> {
        let (keys, members) = self.read_snapshot(|conn| {
            let keys = query_keys(
                conn,
                &format!(
                    "SELECT {KEY_COLUMNS} FROM keyring
                     WHERE is_active = 1
                     ORDER BY created_at ASC"
                ),
                [],
            )?;

            let mut members = Vec::new();
            for key in &keys {
                members.extend(members_for_channel(conn, &key.key_id, true)?);
            }
            Ok((keys, members))
        })?;

        tracing::info!(keys = keys.len(), members = members.len(), "exported keyring backup");

        Ok(BackupPayload {
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            keys,
            members,
        })
    }

    /// Restore a backup, upserting keys by id and members by
    /// `(channel_key_id, phone_number)`.  Member ids are reassigned.
    /// Nothing is written unless every row is.
    pub fn import_backup(&self, payload: &BackupPayload) -> Result<ImportStats> {
        let stats = self.write(&Table::ALL, |tx, statements| {
            let mut stats = ImportStats::default();

            for key in &payload.keys {
                insert_key_row(tx, statements, key)?;
                stats.keys_imported += 1;
            }

            for member in &payload.members {
                let member = ChannelMember {
                    id: 0,
                    ..member.clone()
                };
                insert_member_row(tx, statements, WriteStatement::InsertMember, &member)?;
                stats.members_imported += 1;
            }

            Ok(stats)
        })?;

        tracing::info!(
            keys = stats.keys_imported,
            members = stats.members_imported,
            backup_version = %payload.version,
            "imported keyring backup"
        );
        Ok(stats)
    }
}
