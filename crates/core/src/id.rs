//! Strongly-typed identifiers used across the ledger.
//!
//! Identifiers are 128-bit UUIDv7 values (time-ordered), rendered as compact
//! base58 strings at the edges and stored as plain UUIDs in the database.

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(Uuid);

/// Identifier of a posted transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(Uuid);

/// Identifier of a posted entry. Doubles as the account version token:
/// an account's `version` is the id of the latest entry posted against it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(Uuid);

macro_rules! impl_id_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Ids generated within the same
            /// instant are not strictly monotonic relative to each other;
            /// prefer passing ids explicitly in tests for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&bs58::encode(self.0.as_bytes()).into_string())
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            /// Parse the base58 display form; a hyphenated UUID is also
            /// accepted so rows read straight out of storage round-trip.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if let Ok(bytes) = bs58::decode(s).into_vec() {
                    if let Ok(raw) = <[u8; 16]>::try_from(bytes.as_slice()) {
                        return Ok(Self(Uuid::from_bytes(raw)));
                    }
                }
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }

        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_id_newtype!(AccountId, "AccountId");
impl_id_newtype!(TransactionId, "TransactionId");
impl_id_newtype!(EntryId, "EntryId");
