//! Search filters and select parameters.
//!
//! Filters narrow a result set; params control ordering and pagination.
//! These apply to the account or transaction dimension, never to entries
//! (a transaction always carries all of its entries).

use serde::{Deserialize, Serialize};

use tally_core::{AccountId, DomainError, EntryId, TransactionId};
use tally_domain::{CurrencyCode, Normal};

/// One `ORDER BY` term. Fields are validated against a per-table whitelist
/// by the backends before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// Ordering and pagination for a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub orderby: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl SearchParams {
    /// Parse a comma-separated order spec; a leading `-` means descending
    /// (`"id,-memo"`).
    pub fn parse_orderby(spec: &str) -> Result<Vec<OrderBy>, DomainError> {
        spec.split(',')
            .map(str::trim)
            .map(|term| {
                let (field, descending) = match term.strip_prefix('-') {
                    Some(rest) => (rest, true),
                    None => (term, false),
                };
                if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(DomainError::validation(format!(
                        "invalid order term: {term:?}"
                    )));
                }
                Ok(OrderBy {
                    field: field.to_string(),
                    descending,
                })
            })
            .collect()
    }

    pub fn order_by(mut self, spec: &str) -> Result<Self, DomainError> {
        self.orderby = Self::parse_orderby(spec)?;
        Ok(self)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Effective row cap. Unbounded queries get a generous ceiling so a
    /// runaway scan cannot be requested by accident.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(1000).min(1000)
    }
}

/// Filters on the account dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    #[serde(default)]
    pub ids: Option<Vec<AccountId>>,
    /// Case-insensitive containment match on the display name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent: Option<AccountId>,
    #[serde(default)]
    pub number: Option<i32>,
    #[serde(default)]
    pub normal: Option<Normal>,
    #[serde(default)]
    pub version: Option<EntryId>,
}

impl AccountFilter {
    pub fn by_ids(ids: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Filters on the transaction dimension. `currency` and `account` match
/// transactions having at least one such entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    #[serde(default)]
    pub ids: Option<Vec<TransactionId>>,
    /// Case-insensitive containment match on the memo.
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub currency: Option<CurrencyCode>,
    #[serde(default)]
    pub account: Option<AccountId>,
}

impl TransactionFilter {
    pub fn by_ids(ids: impl IntoIterator<Item = TransactionId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn by_memo(memo: impl Into<String>) -> Self {
        Self {
            memo: Some(memo.into()),
            ..Self::default()
        }
    }
}

/// Filters on the currency registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyFilter {
    #[serde(default)]
    pub codes: Option<Vec<CurrencyCode>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_order_spec() {
        let terms = SearchParams::parse_orderby("id,-memo").unwrap();
        assert_eq!(
            terms,
            vec![
                OrderBy {
                    field: "id".into(),
                    descending: false,
                },
                OrderBy {
                    field: "memo".into(),
                    descending: true,
                },
            ]
        );
    }

    #[test]
    fn rejects_hostile_order_spec() {
        assert!(SearchParams::parse_orderby("id; drop table entry").is_err());
        assert!(SearchParams::parse_orderby("").is_err());
    }

    #[test]
    fn caps_the_limit() {
        assert_eq!(SearchParams::default().effective_limit(), 1000);
        assert_eq!(SearchParams::default().limit(5).effective_limit(), 5);
        assert_eq!(SearchParams::default().limit(10_000).effective_limit(), 1000);
    }
}
