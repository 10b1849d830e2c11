//! Domain model structs persisted in the local keyring database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer or written into a backup payload.  Enumerations
//! are stored as fixed upper-case strings; an unknown string read back from
//! disk is a [`DecodeError`], never a silent default.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cover text used when a channel is created without one.
pub const DEFAULT_COVER_MESSAGE: &str = "Noted 👍";

/// A value read from the database that has no Rust representation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown {kind} value {value:?}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("timestamp {0} ms is out of range")]
    Timestamp(i64),
}

// ---------------------------------------------------------------------------
// Stored enumerations
// ---------------------------------------------------------------------------

macro_rules! stored_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The string persisted for this variant.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(DecodeError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: DecodeError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

stored_enum! {
    /// Role of a member within a channel.
    MemberRole as "member role" {
        Admin => "ADMIN",
        Member => "MEMBER",
    }
}

stored_enum! {
    /// How a member was imported into the channel.
    ContactSource as "contact source" {
        /// Scanned from the messaging group's member list.
        Scanned => "SCANNED",
        /// Matched from the device address book.
        Contacts => "CONTACTS",
        /// Entered by hand.
        Manual => "MANUAL",
    }
}

stored_enum! {
    /// Progress of delivering the channel key to a member.
    KeyDeliveryStatus as "key delivery status" {
        Pending => "PENDING",
        SentWhatsapp => "SENT_WHATSAPP",
        SentSms => "SENT_SMS",
        Delivered => "DELIVERED",
        Failed => "FAILED",
    }
}

impl KeyDeliveryStatus {
    /// Whether reaching this status means the member now holds the key.
    pub fn confirms_delivery(self) -> bool {
        matches!(self, KeyDeliveryStatus::Delivered)
    }
}

// ---------------------------------------------------------------------------
// ChannelKey
// ---------------------------------------------------------------------------

/// A channel's symmetric key together with its display metadata.
///
/// `key_id` is the primary key.  `is_active` is a soft-delete flag: keys that
/// were rotated out or dissolved stay in the table with `is_active = false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub key_id: String,
    /// Human-readable channel name.  May be renamed later.
    pub channel_name: String,
    /// Encoded key bytes.  Opaque to the store.
    pub symmetric_key_material: String,
    /// Creation time, millisecond precision.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    /// External messaging group this channel is attached to, if any.
    pub linked_group_name: Option<String>,
    /// Decoy text shown alongside encrypted traffic.
    pub cover_message: String,
    /// Identity of the key's originator.
    pub creator_uid: Option<String>,
}

impl ChannelKey {
    /// A new active key created now with the default cover message.
    pub fn new(
        key_id: impl Into<String>,
        channel_name: impl Into<String>,
        symmetric_key_material: impl Into<String>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            channel_name: channel_name.into(),
            symmetric_key_material: symmetric_key_material.into(),
            created_at: now_millis(),
            is_active: true,
            linked_group_name: None,
            cover_message: DEFAULT_COVER_MESSAGE.to_string(),
            creator_uid: None,
        }
    }

    pub fn with_linked_group(mut self, group: impl Into<String>) -> Self {
        self.linked_group_name = Some(group.into());
        self
    }

    pub fn with_creator(mut self, uid: impl Into<String>) -> Self {
        self.creator_uid = Some(uid.into());
        self
    }

    pub fn with_cover_message(mut self, text: impl Into<String>) -> Self {
        self.cover_message = text.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

// ---------------------------------------------------------------------------
// ChannelMember
// ---------------------------------------------------------------------------

/// A contact attached to a channel and the delivery state of its key.
///
/// `(channel_key_id, phone_number)` is unique.  An `id` of `0` asks the
/// database to assign one on insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub id: i64,
    /// `ChannelKey::key_id` of the channel.  Not enforced by a foreign key.
    pub channel_key_id: String,
    pub contact_name: String,
    /// Phone number in international format.
    pub phone_number: String,
    pub role: MemberRole,
    /// True once delivery of the key is confirmed.
    pub has_key: bool,
    pub contact_source: ContactSource,
    pub key_delivery_status: KeyDeliveryStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub added_at: DateTime<Utc>,
}

impl ChannelMember {
    /// A pending, manually added member without an assigned id.
    pub fn new(
        channel_key_id: impl Into<String>,
        contact_name: impl Into<String>,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            channel_key_id: channel_key_id.into(),
            contact_name: contact_name.into(),
            phone_number: phone_number.into(),
            role: MemberRole::Member,
            has_key: false,
            contact_source: ContactSource::Manual,
            key_delivery_status: KeyDeliveryStatus::Pending,
            added_at: now_millis(),
        }
    }

    pub fn with_role(mut self, role: MemberRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_source(mut self, source: ContactSource) -> Self {
        self.contact_source = source;
        self
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time truncated to the millisecond precision the store keeps.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Decode an epoch-millisecond column.
pub(crate) fn millis_to_datetime(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            Box::new(DecodeError::Timestamp(millis)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_round_trip() {
        for status in KeyDeliveryStatus::ALL {
            assert_eq!(status.as_str().parse::<KeyDeliveryStatus>().unwrap(), *status);
        }
        assert_eq!(KeyDeliveryStatus::SentWhatsapp.as_str(), "SENT_WHATSAPP");
        assert_eq!(ContactSource::Scanned.to_string(), "SCANNED");
    }

    #[test]
    fn unknown_enum_string_is_rejected() {
        let err = "OWNER".parse::<MemberRole>().unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownVariant {
                kind: "member role",
                value: "OWNER".to_string()
            }
        );
        // Case matters: only the exact persisted spelling is accepted.
        assert!("admin".parse::<MemberRole>().is_err());
    }

    #[test]
    fn serde_matches_storage_spelling() {
        let json = serde_json::to_string(&KeyDeliveryStatus::SentSms).unwrap();
        assert_eq!(json, "\"SENT_SMS\"");
    }

    #[test]
    fn only_delivered_confirms_delivery() {
        let confirming: Vec<_> = KeyDeliveryStatus::ALL
            .iter()
            .filter(|s| s.confirms_delivery())
            .collect();
        assert_eq!(confirming, vec![&KeyDeliveryStatus::Delivered]);
    }

    #[test]
    fn new_key_defaults() {
        let key = ChannelKey::new("a1b2", "Study Group", "c2VjcmV0");
        assert!(key.is_active);
        assert_eq!(key.cover_message, DEFAULT_COVER_MESSAGE);
        assert_eq!(key.created_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
