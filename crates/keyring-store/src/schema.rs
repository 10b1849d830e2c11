//! Schema registry.
//!
//! The registry is the single description of the two keyring tables.  It is
//! used to issue the DDL for a fresh database and to compare an existing
//! database's live shape (via the `pragma_table_info` / `pragma_index_list`
//! table-valued functions) against what this build expects.
//!
//! A fingerprint of the registry is written to `schema_identity` so drift is
//! caught even when every column happens to line up.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 2;

/// Name of the single-row table holding the schema fingerprint.
pub const IDENTITY_TABLE: &str = "schema_identity";

/// Tables whose writes are tracked for invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Keyring,
    ChannelMembers,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Keyring, Table::ChannelMembers];

    pub fn name(self) -> &'static str {
        self.definition().name
    }

    pub fn definition(self) -> &'static TableSpec {
        match self {
            Table::Keyring => &KEYRING,
            Table::ChannelMembers => &CHANNEL_MEMBERS,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Registry types
// ---------------------------------------------------------------------------

/// Declared storage class of a column.  Booleans are stored as `INTEGER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    pub fn as_str(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }
}

#[derive(Debug)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub not_null: bool,
    /// 1-based position in the primary key, 0 if not part of it.
    pub primary_key: u8,
    pub autoincrement: bool,
}

#[derive(Debug)]
pub struct IndexSpec {
    pub name: &'static str,
    pub unique: bool,
    pub columns: &'static [&'static str],
}

#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub indexes: &'static [IndexSpec],
}

const fn column(name: &'static str, sql_type: SqlType, not_null: bool) -> ColumnSpec {
    ColumnSpec {
        name,
        sql_type,
        not_null,
        primary_key: 0,
        autoincrement: false,
    }
}

pub static KEYRING: TableSpec = TableSpec {
    name: "keyring",
    columns: &[
        ColumnSpec {
            primary_key: 1,
            ..column("key_id", SqlType::Text, true)
        },
        column("channel_name", SqlType::Text, true),
        column("symmetric_key_material", SqlType::Text, true),
        column("created_at", SqlType::Integer, true),
        column("is_active", SqlType::Integer, true),
        column("linked_group_name", SqlType::Text, false),
        column("cover_message", SqlType::Text, true),
        column("creator_uid", SqlType::Text, false),
    ],
    indexes: &[],
};

pub static CHANNEL_MEMBERS: TableSpec = TableSpec {
    name: "channel_members",
    columns: &[
        ColumnSpec {
            primary_key: 1,
            autoincrement: true,
            ..column("id", SqlType::Integer, true)
        },
        column("channel_key_id", SqlType::Text, true),
        column("contact_name", SqlType::Text, true),
        column("phone_number", SqlType::Text, true),
        column("role", SqlType::Text, true),
        column("has_key", SqlType::Integer, true),
        column("contact_source", SqlType::Text, true),
        column("key_delivery_status", SqlType::Text, true),
        column("added_at", SqlType::Integer, true),
    ],
    indexes: &[
        IndexSpec {
            name: "index_channel_members_channel_key_id",
            unique: false,
            columns: &["channel_key_id"],
        },
        IndexSpec {
            name: "index_channel_members_channel_key_id_phone_number",
            unique: true,
            columns: &["channel_key_id", "phone_number"],
        },
    ],
};

impl TableSpec {
    /// `CREATE TABLE IF NOT EXISTS` statement for this table.
    pub fn create_table_sql(&self) -> String {
        let inline_pk = self.columns.iter().any(|c| c.autoincrement);

        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", c.name, c.sql_type.as_str());
                if c.autoincrement {
                    def.push_str(" PRIMARY KEY AUTOINCREMENT");
                }
                if c.not_null {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        if !inline_pk {
            let mut pk: Vec<&ColumnSpec> =
                self.columns.iter().filter(|c| c.primary_key > 0).collect();
            pk.sort_by_key(|c| c.primary_key);
            if !pk.is_empty() {
                let names: Vec<&str> = pk.iter().map(|c| c.name).collect();
                defs.push(format!("PRIMARY KEY ({})", names.join(", ")));
            }
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            defs.join(",\n    ")
        )
    }

    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS` statements for this table.
    pub fn create_index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|idx| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if idx.unique { "UNIQUE " } else { "" },
                    idx.name,
                    self.name,
                    idx.columns.join(", ")
                )
            })
            .collect()
    }
}

impl fmt::Display for TableSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(
                f,
                "{}:{}:{}:{}",
                c.name,
                c.sql_type.as_str(),
                if c.not_null { "NN" } else { "N" },
                c.primary_key
            )?;
        }
        f.write_str(")")?;
        for idx in self.indexes {
            write!(
                f,
                "[{}{}:{}]",
                if idx.unique { "U:" } else { "" },
                idx.name,
                idx.columns.join(",")
            )?;
        }
        Ok(())
    }
}

/// BLAKE3 fingerprint (hex) of the registry.
pub fn identity_hash() -> String {
    let canonical: Vec<String> = Table::ALL.iter().map(|t| t.definition().to_string()).collect();
    blake3::hash(canonical.join("\n").as_bytes())
        .to_hex()
        .to_string()
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Create every table and index if missing and record the schema identity.
///
/// Idempotent.  Callers wrap it in a transaction together with the
/// `user_version` update.
pub fn create_all(conn: &Connection) -> Result<()> {
    for table in Table::ALL {
        let def = table.definition();
        conn.execute(&def.create_table_sql(), [])?;
        for sql in def.create_index_sql() {
            conn.execute(&sql, [])?;
        }
    }
    write_identity(conn)
}

/// Create the identity table if needed and store the current fingerprint.
pub fn write_identity(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_identity (
             id            INTEGER PRIMARY KEY,
             identity_hash TEXT NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_identity (id, identity_hash) VALUES (1, ?1)",
        params![identity_hash()],
    )?;
    Ok(())
}

/// Whether a table of the given name exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single difference between the registry and the live schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDiff {
    MissingTable {
        table: &'static str,
    },
    MissingColumn {
        table: &'static str,
        column: &'static str,
        sql_type: SqlType,
    },
    UnexpectedColumn {
        table: &'static str,
        column: String,
    },
    ColumnType {
        table: &'static str,
        column: &'static str,
        expected: SqlType,
        found: String,
    },
    Nullability {
        table: &'static str,
        column: &'static str,
        expected_not_null: bool,
    },
    PrimaryKey {
        table: &'static str,
        column: &'static str,
        expected: u8,
        found: u8,
    },
    MissingIndex {
        table: &'static str,
        index: &'static str,
    },
    IndexShape {
        table: &'static str,
        index: &'static str,
        expected: String,
        found: String,
    },
    UnexpectedIndex {
        table: &'static str,
        index: String,
    },
    IdentityMarker {
        expected: String,
        found: Option<String>,
    },
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDiff::MissingTable { table } => write!(f, "{table}: table is missing"),
            SchemaDiff::MissingColumn {
                table,
                column,
                sql_type,
            } => write!(
                f,
                "{table}: missing column `{column}` ({})",
                sql_type.as_str()
            ),
            SchemaDiff::UnexpectedColumn { table, column } => {
                write!(f, "{table}: unexpected column `{column}`")
            }
            SchemaDiff::ColumnType {
                table,
                column,
                expected,
                found,
            } => write!(
                f,
                "{table}.{column}: expected type {}, found {found:?}",
                expected.as_str()
            ),
            SchemaDiff::Nullability {
                table,
                column,
                expected_not_null,
            } => write!(
                f,
                "{table}.{column}: expected {}",
                if *expected_not_null { "NOT NULL" } else { "nullable" }
            ),
            SchemaDiff::PrimaryKey {
                table,
                column,
                expected,
                found,
            } => write!(
                f,
                "{table}.{column}: expected primary key position {expected}, found {found}"
            ),
            SchemaDiff::MissingIndex { table, index } => {
                write!(f, "{table}: missing index `{index}`")
            }
            SchemaDiff::IndexShape {
                table,
                index,
                expected,
                found,
            } => write!(f, "{table}: index `{index}` expected {expected}, found {found}"),
            SchemaDiff::UnexpectedIndex { table, index } => {
                write!(f, "{table}: unexpected index `{index}`")
            }
            SchemaDiff::IdentityMarker { expected, found } => match found {
                Some(found) => write!(
                    f,
                    "schema identity mismatch: expected {expected}, found {found}"
                ),
                None => write!(f, "schema identity marker is missing"),
            },
        }
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Mismatch(Vec<SchemaDiff>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    /// One line per difference; empty when valid.
    pub fn describe(&self) -> String {
        match self {
            ValidationResult::Valid => String::new(),
            ValidationResult::Mismatch(diffs) => diffs
                .iter()
                .map(|d| format!("  - {d}"))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

struct LiveColumn {
    name: String,
    sql_type: String,
    not_null: bool,
    pk: u8,
}

struct LiveIndex {
    name: String,
    unique: bool,
    columns: Vec<String>,
}

impl LiveIndex {
    fn shape(&self) -> String {
        shape(self.unique, &self.columns)
    }
}

fn shape<S: AsRef<str>>(unique: bool, columns: &[S]) -> String {
    let cols: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    format!(
        "{}({})",
        if unique { "UNIQUE " } else { "" },
        cols.join(", ")
    )
}

fn read_columns(conn: &Connection, table: &str) -> Result<Vec<LiveColumn>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok(LiveColumn {
            name: row.get(0)?,
            sql_type: row.get(1)?,
            not_null: row.get(2)?,
            pk: row.get(3)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Explicitly created indexes only; automatic primary-key/unique indexes are
/// implied by the column definitions.
fn read_indexes(conn: &Connection, table: &str) -> Result<Vec<LiveIndex>> {
    let mut list = conn.prepare(
        "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name",
    )?;
    let heads = list
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let mut indexes = Vec::with_capacity(heads.len());
    for (name, unique) in heads {
        let columns = info
            .query_map(params![name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        indexes.push(LiveIndex {
            name,
            unique,
            columns,
        });
    }
    Ok(indexes)
}

fn diff_table(conn: &Connection, def: &'static TableSpec, diffs: &mut Vec<SchemaDiff>) -> Result<()> {
    let live = read_columns(conn, def.name)?;
    if live.is_empty() {
        diffs.push(SchemaDiff::MissingTable { table: def.name });
        return Ok(());
    }

    for expected in def.columns {
        let Some(found) = live
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(expected.name))
        else {
            diffs.push(SchemaDiff::MissingColumn {
                table: def.name,
                column: expected.name,
                sql_type: expected.sql_type,
            });
            continue;
        };

        if !found.sql_type.eq_ignore_ascii_case(expected.sql_type.as_str()) {
            diffs.push(SchemaDiff::ColumnType {
                table: def.name,
                column: expected.name,
                expected: expected.sql_type,
                found: found.sql_type.clone(),
            });
        }
        if found.not_null != expected.not_null {
            diffs.push(SchemaDiff::Nullability {
                table: def.name,
                column: expected.name,
                expected_not_null: expected.not_null,
            });
        }
        if found.pk != expected.primary_key {
            diffs.push(SchemaDiff::PrimaryKey {
                table: def.name,
                column: expected.name,
                expected: expected.primary_key,
                found: found.pk,
            });
        }
    }

    for found in &live {
        if !def
            .columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(&found.name))
        {
            diffs.push(SchemaDiff::UnexpectedColumn {
                table: def.name,
                column: found.name.clone(),
            });
        }
    }

    let live_indexes = read_indexes(conn, def.name)?;
    for expected in def.indexes {
        match live_indexes.iter().find(|i| i.name == expected.name) {
            None => diffs.push(SchemaDiff::MissingIndex {
                table: def.name,
                index: expected.name,
            }),
            Some(found) => {
                let expected_shape = shape(expected.unique, expected.columns);
                if found.shape() != expected_shape {
                    diffs.push(SchemaDiff::IndexShape {
                        table: def.name,
                        index: expected.name,
                        expected: expected_shape,
                        found: found.shape(),
                    });
                }
            }
        }
    }
    for found in &live_indexes {
        if !def.indexes.iter().any(|i| i.name == found.name) {
            diffs.push(SchemaDiff::UnexpectedIndex {
                table: def.name,
                index: found.name.clone(),
            });
        }
    }

    Ok(())
}

/// Compare the live schema against the registry, column by column and index
/// by index, then check the identity marker.
pub fn validate(conn: &Connection) -> Result<ValidationResult> {
    let mut diffs = Vec::new();
    for table in Table::ALL {
        diff_table(conn, table.definition(), &mut diffs)?;
    }

    let expected = identity_hash();
    let found: Option<String> = if table_exists(conn, IDENTITY_TABLE)? {
        conn.query_row(
            "SELECT identity_hash FROM schema_identity WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?
    } else {
        None
    };
    if found.as_deref() != Some(expected.as_str()) {
        diffs.push(SchemaDiff::IdentityMarker { expected, found });
    }

    if diffs.is_empty() {
        Ok(ValidationResult::Valid)
    } else {
        Ok(ValidationResult::Mismatch(diffs))
    }
}
