//! Operations on [`ChannelMember`] records.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, Row};

use crate::database::Database;
use crate::error::Result;
use crate::keys::keys_for_group;
use crate::live::LiveQuery;
use crate::models::{millis_to_datetime, now_millis, ChannelMember, KeyDeliveryStatus};
use crate::schema::Table;
use crate::statements::{StatementCache, WriteStatement};

pub(crate) const MEMBER_COLUMNS: &str = "id, channel_key_id, contact_name, phone_number, role, \
     has_key, contact_source, key_delivery_status, added_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a member, replacing any row that collides on `id` or on
    /// `(channel_key_id, phone_number)`.  Returns the row id.
    pub fn insert_member(&self, member: &ChannelMember) -> Result<i64> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            insert_member_row(tx, statements, WriteStatement::InsertMember, member)
        })
    }

    /// Insert several members with [`insert_member`](Self::insert_member)
    /// semantics.  Either every row is written or none is.
    pub fn insert_members(&self, members: &[ChannelMember]) -> Result<Vec<i64>> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            members
                .iter()
                .map(|m| insert_member_row(tx, statements, WriteStatement::InsertMember, m))
                .collect()
        })
    }

    /// Insert a member without replacing.  A phone number already present in
    /// the channel fails with [`StoreError::ConstraintViolation`].
    ///
    /// [`StoreError::ConstraintViolation`]: crate::StoreError::ConstraintViolation
    pub fn add_member(&self, member: &ChannelMember) -> Result<i64> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            insert_member_row(tx, statements, WriteStatement::AddMember, member)
        })
    }

    /// Copy every member of `from_key_id` into `to_key_id` with fresh ids and
    /// delivery reset to pending.  Returns the number of members copied.
    pub fn copy_members_to_channel(&self, from_key_id: &str, to_key_id: &str) -> Result<usize> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            let source = members_for_channel(tx, from_key_id, false)?;
            let added_at = now_millis();
            for member in &source {
                let copy = ChannelMember {
                    id: 0,
                    channel_key_id: to_key_id.to_string(),
                    has_key: false,
                    key_delivery_status: KeyDeliveryStatus::Pending,
                    added_at,
                    ..member.clone()
                };
                insert_member_row(tx, statements, WriteStatement::InsertMember, &copy)?;
            }
            Ok(source.len())
        })
    }

    // ------------------------------------------------------------------
    // Update / delete
    // ------------------------------------------------------------------

    /// Set a member's delivery status and key flag in a single statement.
    pub fn update_member_delivery_status(
        &self,
        member_id: i64,
        status: KeyDeliveryStatus,
        has_key: bool,
    ) -> Result<bool> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::UpdateMemberDeliveryStatus)?;
            Ok(stmt.execute(params![member_id, status, has_key])? > 0)
        })
    }

    pub fn delete_member(&self, member_id: i64) -> Result<bool> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::DeleteMember)?;
            Ok(stmt.execute(params![member_id])? > 0)
        })
    }

    pub fn delete_member_by_phone(&self, channel_key_id: &str, phone_number: &str) -> Result<bool> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::DeleteMemberByPhone)?;
            Ok(stmt.execute(params![channel_key_id, phone_number])? > 0)
        })
    }

    /// Remove every member of a channel.  Returns how many were removed.
    pub fn delete_all_members(&self, channel_key_id: &str) -> Result<usize> {
        self.write(&[Table::ChannelMembers], |tx, statements| {
            let mut stmt = statements.acquire(tx, WriteStatement::DeleteAllMembers)?;
            Ok(stmt.execute(params![channel_key_id])?)
        })
    }

    // ------------------------------------------------------------------
    // One-shot reads
    // ------------------------------------------------------------------

    /// Members of a channel, in storage order.
    pub fn get_members_for_channel_list(&self, channel_key_id: &str) -> Result<Vec<ChannelMember>> {
        self.read(|conn| members_for_channel(conn, channel_key_id, false))
    }

    /// Members of a channel that do not hold the key yet.
    pub fn get_pending_members(&self, channel_key_id: &str) -> Result<Vec<ChannelMember>> {
        self.read(|conn| {
            query_members(
                conn,
                &format!(
                    "SELECT {MEMBER_COLUMNS} FROM channel_members
                     WHERE channel_key_id = ?1 AND has_key = 0"
                ),
                params![channel_key_id],
            )
        })
    }

    pub fn get_member_count(&self, channel_key_id: &str) -> Result<u32> {
        self.read(|conn| member_count(conn, channel_key_id))
    }

    /// Whether another active channel linked to `group_name` already has
    /// exactly the member set `phones`.
    ///
    /// Reads every sibling channel from one snapshot.
    pub fn has_duplicate_member_set(
        &self,
        group_name: &str,
        exclude_key_id: &str,
        phones: &BTreeSet<String>,
    ) -> Result<bool> {
        self.read_snapshot(|conn| {
            for sibling in keys_for_group(conn, group_name)? {
                if sibling.key_id == exclude_key_id {
                    continue;
                }
                let existing: BTreeSet<String> = members_for_channel(conn, &sibling.key_id, false)?
                    .into_iter()
                    .map(|m| m.phone_number)
                    .collect();
                if &existing == phones {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    // ------------------------------------------------------------------
    // Continuous reads
    // ------------------------------------------------------------------

    /// Members of a channel ordered by contact name.
    pub fn members_for_channel(&self, channel_key_id: &str) -> LiveQuery<Vec<ChannelMember>> {
        let channel_key_id = channel_key_id.to_string();
        self.live("members_for_channel", &[Table::ChannelMembers], move |conn| {
            members_for_channel(conn, &channel_key_id, true)
        })
    }

    pub fn member_count(&self, channel_key_id: &str) -> LiveQuery<u32> {
        let channel_key_id = channel_key_id.to_string();
        self.live("member_count", &[Table::ChannelMembers], move |conn| {
            member_count(conn, &channel_key_id)
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn insert_member_row(
    conn: &Connection,
    statements: &StatementCache,
    kind: WriteStatement,
    member: &ChannelMember,
) -> Result<i64> {
    let mut stmt = statements.acquire(conn, kind)?;
    stmt.execute(params![
        member.id,
        member.channel_key_id,
        member.contact_name,
        member.phone_number,
        member.role,
        member.has_key,
        member.contact_source,
        member.key_delivery_status,
        member.added_at.timestamp_millis(),
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn members_for_channel(
    conn: &Connection,
    channel_key_id: &str,
    by_name: bool,
) -> Result<Vec<ChannelMember>> {
    let sql = if by_name {
        format!(
            "SELECT {MEMBER_COLUMNS} FROM channel_members
             WHERE channel_key_id = ?1
             ORDER BY contact_name ASC"
        )
    } else {
        format!("SELECT {MEMBER_COLUMNS} FROM channel_members WHERE channel_key_id = ?1")
    };
    query_members(conn, &sql, params![channel_key_id])
}

fn query_members<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ChannelMember>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, row_to_member)?;

    let mut members = Vec::new();
    for row in rows {
        members.push(row?);
    }
    Ok(members)
}

fn member_count(conn: &Connection, channel_key_id: &str) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM channel_members WHERE channel_key_id = ?1",
        params![channel_key_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Map a row selected with [`MEMBER_COLUMNS`] into a [`ChannelMember`].
///
/// Unknown enum strings fail the whole read.
pub(crate) fn row_to_member(row: &Row<'_>) -> rusqlite::Result<ChannelMember> {
    Ok(ChannelMember {
        id: row.get(0)?,
        channel_key_id: row.get(1)?,
        contact_name: row.get(2)?,
        phone_number: row.get(3)?,
        role: row.get(4)?,
        has_key: row.get(5)?,
        contact_source: row.get(6)?,
        key_delivery_status: row.get(7)?,
        added_at: millis_to_datetime(8, row.get(8)?)?,
    })
}
