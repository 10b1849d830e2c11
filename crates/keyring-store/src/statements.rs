//! Reusable prepared write statements.
//!
//! Each [`WriteStatement`] is prepared lazily on the writer connection the
//! first time it is acquired and kept in rusqlite's per-connection statement
//! cache afterwards.  Acquisition returns a [`StatementLease`]; dropping the
//! lease (on success, on `?` propagation, or during unwinding) resets the
//! statement and hands it back to the cache.  A kind that is currently leased
//! cannot be acquired again until the lease is dropped.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};

use rusqlite::{CachedStatement, Connection, Statement};

use crate::error::{Result, StoreError};

/// Every parameterized write the store issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStatement {
    InsertKey,
    InsertMember,
    AddMember,
    DeactivateKey,
    DeleteKey,
    UpdateCoverMessage,
    UpdateLinkedGroup,
    RenameChannel,
    UpdateMemberDeliveryStatus,
    DeleteMember,
    DeleteMemberByPhone,
    DeleteAllMembers,
}

impl WriteStatement {
    pub const ALL: [WriteStatement; 12] = [
        WriteStatement::InsertKey,
        WriteStatement::InsertMember,
        WriteStatement::AddMember,
        WriteStatement::DeactivateKey,
        WriteStatement::DeleteKey,
        WriteStatement::UpdateCoverMessage,
        WriteStatement::UpdateLinkedGroup,
        WriteStatement::RenameChannel,
        WriteStatement::UpdateMemberDeliveryStatus,
        WriteStatement::DeleteMember,
        WriteStatement::DeleteMemberByPhone,
        WriteStatement::DeleteAllMembers,
    ];

    pub fn sql(self) -> &'static str {
        match self {
            WriteStatement::InsertKey => {
                "INSERT OR REPLACE INTO keyring
                     (key_id, channel_name, symmetric_key_material, created_at,
                      is_active, linked_group_name, cover_message, creator_uid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            }
            // nullif: an id of 0 lets SQLite assign the next rowid.
            WriteStatement::InsertMember => {
                "INSERT OR REPLACE INTO channel_members
                     (id, channel_key_id, contact_name, phone_number, role,
                      has_key, contact_source, key_delivery_status, added_at)
                 VALUES (nullif(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            }
            WriteStatement::AddMember => {
                "INSERT INTO channel_members
                     (id, channel_key_id, contact_name, phone_number, role,
                      has_key, contact_source, key_delivery_status, added_at)
                 VALUES (nullif(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            }
            WriteStatement::DeactivateKey => "UPDATE keyring SET is_active = 0 WHERE key_id = ?1",
            WriteStatement::DeleteKey => "DELETE FROM keyring WHERE key_id = ?1",
            WriteStatement::UpdateCoverMessage => {
                "UPDATE keyring SET cover_message = ?2 WHERE key_id = ?1"
            }
            WriteStatement::UpdateLinkedGroup => {
                "UPDATE keyring SET linked_group_name = ?2 WHERE key_id = ?1"
            }
            WriteStatement::RenameChannel => {
                "UPDATE keyring SET channel_name = ?2 WHERE key_id = ?1"
            }
            WriteStatement::UpdateMemberDeliveryStatus => {
                "UPDATE channel_members SET key_delivery_status = ?2, has_key = ?3 WHERE id = ?1"
            }
            WriteStatement::DeleteMember => "DELETE FROM channel_members WHERE id = ?1",
            WriteStatement::DeleteMemberByPhone => {
                "DELETE FROM channel_members WHERE channel_key_id = ?1 AND phone_number = ?2"
            }
            WriteStatement::DeleteAllMembers => {
                "DELETE FROM channel_members WHERE channel_key_id = ?1"
            }
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Lease bookkeeping for the writer connection's prepared statements.
///
/// Lives next to the writer connection behind the same mutex, so it is never
/// shared across threads; `Cell` is enough.
#[derive(Debug, Default)]
pub struct StatementCache {
    leased: Cell<u16>,
    prepared: Cell<u16>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity the owning connection's statement cache needs so no write
    /// statement is ever evicted.
    pub const fn capacity() -> usize {
        WriteStatement::ALL.len() + 4
    }

    /// Lease the prepared statement for `kind`, preparing it on first use.
    pub fn acquire<'c>(
        &'c self,
        conn: &'c Connection,
        kind: WriteStatement,
    ) -> Result<StatementLease<'c>> {
        let bit = kind.bit();
        if self.leased.get() & bit != 0 {
            return Err(StoreError::StatementBusy(kind));
        }

        let stmt = conn.prepare_cached(kind.sql())?;
        if self.prepared.get() & bit == 0 {
            tracing::debug!(statement = ?kind, "prepared write statement");
            self.prepared.set(self.prepared.get() | bit);
        }

        self.leased.set(self.leased.get() | bit);
        Ok(StatementLease {
            cache: self,
            kind,
            stmt,
        })
    }

    /// Whether `kind` has been prepared on this connection.
    pub fn is_prepared(&self, kind: WriteStatement) -> bool {
        self.prepared.get() & kind.bit() != 0
    }

    /// Whether `kind` is currently leased.
    pub fn is_leased(&self, kind: WriteStatement) -> bool {
        self.leased.get() & kind.bit() != 0
    }
}

/// Scoped ownership of one prepared write statement.
pub struct StatementLease<'c> {
    cache: &'c StatementCache,
    kind: WriteStatement,
    stmt: CachedStatement<'c>,
}

impl StatementLease<'_> {
    pub fn kind(&self) -> WriteStatement {
        self.kind
    }
}

impl<'c> Deref for StatementLease<'c> {
    type Target = Statement<'c>;

    fn deref(&self) -> &Self::Target {
        &self.stmt
    }
}

impl DerefMut for StatementLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.stmt
    }
}

impl Drop for StatementLease<'_> {
    fn drop(&mut self) {
        let bit = self.kind.bit();
        self.cache.leased.set(self.cache.leased.get() & !bit);
    }
}
