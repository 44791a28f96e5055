//! Accounts and their normal balance side.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, DomainError, EntryId};

/// The entry direction that increases an account's balance.
///
/// Used only as a sign when rendering balances; entries are never validated
/// against it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Normal {
    Dr,
    Cr,
}

impl Normal {
    /// Signed unit for balance arithmetic: DR = +1, CR = -1.
    pub fn unit(&self) -> Decimal {
        match self {
            Normal::Dr => Decimal::ONE,
            Normal::Cr => -Decimal::ONE,
        }
    }
}

impl core::fmt::Display for Normal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Normal::Dr => "DR",
            Normal::Cr => "CR",
        })
    }
}

impl core::str::FromStr for Normal {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DR" => Ok(Normal::Dr),
            "CR" => Ok(Normal::Cr),
            other => Err(DomainError::validation(format!(
                "invalid normal side: {other:?}"
            ))),
        }
    }
}

/// Validated account display name: word characters, `-`, `.`, and spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AccountName(String);

impl AccountName {
    pub fn parse(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '));
        if !valid {
            return Err(DomainError::validation(format!(
                "invalid account name: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AccountName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AccountName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}

/// A ledger account.
///
/// Accounts are created/updated via upsert and never deleted. `version`
/// holds the id of the latest entry posted against the account (the
/// optimistic-lock token) and is advanced only by the posting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AccountId>,
    pub name: AccountName,
    pub normal: Normal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<EntryId>,
}

impl Account {
    pub fn new(name: AccountName, normal: Normal) -> Self {
        Self {
            id: AccountId::new(),
            parent_id: None,
            name,
            normal,
            number: None,
            version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normal_units() {
        assert_eq!(Normal::Dr.unit(), dec!(1));
        assert_eq!(Normal::Cr.unit(), dec!(-1));
    }

    #[test]
    fn normal_parses_canonical_names_only() {
        assert_eq!("DR".parse::<Normal>().unwrap(), Normal::Dr);
        assert_eq!("CR".parse::<Normal>().unwrap(), Normal::Cr);
        assert!("dr".parse::<Normal>().is_err());
    }

    #[test]
    fn account_names() {
        assert!(AccountName::parse("Accounts Receivable").is_ok());
        assert!(AccountName::parse("Asset-1.2").is_ok());
        assert!(AccountName::parse("").is_err());
        assert!(AccountName::parse("bad/name").is_err());
    }
}
