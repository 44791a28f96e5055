//! Entries: one debit-or-credit line item against one account.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, DomainError, EntryId, TransactionId};

use crate::currency::CurrencyCode;

/// The amount of an entry: exactly one of a debit or a credit magnitude,
/// always strictly positive. Constructing through [`EntryAmount::dr`] /
/// [`EntryAmount::cr`] is the only validation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAmount {
    Dr(Decimal),
    Cr(Decimal),
}

impl EntryAmount {
    pub fn dr(magnitude: Decimal) -> Result<Self, DomainError> {
        Self::positive(magnitude).map(Self::Dr)
    }

    pub fn cr(magnitude: Decimal) -> Result<Self, DomainError> {
        Self::positive(magnitude).map(Self::Cr)
    }

    fn positive(magnitude: Decimal) -> Result<Decimal, DomainError> {
        if magnitude <= Decimal::ZERO {
            return Err(DomainError::validation(
                "amount must be greater than zero: accountants hate negatives",
            ));
        }
        Ok(magnitude)
    }

    /// Signed value: debits positive, credits negative, independent of the
    /// account's normal side.
    pub fn signed(&self) -> Decimal {
        match self {
            EntryAmount::Dr(d) => *d,
            EntryAmount::Cr(c) => -*c,
        }
    }

    /// Debit magnitude, if this is a debit.
    pub fn dr_magnitude(&self) -> Option<Decimal> {
        match self {
            EntryAmount::Dr(d) => Some(*d),
            EntryAmount::Cr(_) => None,
        }
    }

    /// Credit magnitude, if this is a credit.
    pub fn cr_magnitude(&self) -> Option<Decimal> {
        match self {
            EntryAmount::Dr(_) => None,
            EntryAmount::Cr(c) => Some(*c),
        }
    }
}

/// A single line item of a transaction.
///
/// `id` and `transaction` are filled by the posting engine; entries are
/// immutable once persisted (no update or delete exists for them).
/// `expected_version` opts the entry into the optimistic version check: when
/// set, posting fails unless it equals the account's current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntryRepr", into = "EntryRepr")]
pub struct Entry {
    pub id: Option<EntryId>,
    pub transaction: Option<TransactionId>,
    pub account: AccountId,
    pub amount: EntryAmount,
    pub currency: CurrencyCode,
    pub expected_version: Option<EntryId>,
}

impl Entry {
    pub fn new(account: AccountId, amount: EntryAmount, currency: CurrencyCode) -> Self {
        Self {
            id: None,
            transaction: None,
            account,
            amount,
            currency,
            expected_version: None,
        }
    }

    pub fn with_expected_version(mut self, version: EntryId) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Signed amount: `dr * (+1)` or `cr * (-1)`.
    pub fn amount(&self) -> Decimal {
        self.amount.signed()
    }
}

/// Wire/storage shape: split `dr`/`cr` columns, exactly one set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<EntryId>,
    #[serde(default, rename = "tx", skip_serializing_if = "Option::is_none")]
    transaction: Option<TransactionId>,
    #[serde(rename = "acct")]
    account: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dr: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cr: Option<Decimal>,
    #[serde(rename = "curr")]
    currency: CurrencyCode,
    #[serde(default, rename = "acct_version", skip_serializing_if = "Option::is_none")]
    expected_version: Option<EntryId>,
}

impl TryFrom<EntryRepr> for Entry {
    type Error = DomainError;

    fn try_from(repr: EntryRepr) -> Result<Self, Self::Error> {
        let amount = match (repr.dr, repr.cr) {
            (Some(dr), None) => EntryAmount::dr(dr)?,
            (None, Some(cr)) => EntryAmount::cr(cr)?,
            (Some(_), Some(_)) => {
                return Err(DomainError::validation("both dr and cr cannot be defined"));
            }
            (None, None) => {
                return Err(DomainError::validation("either dr or cr must be defined"));
            }
        };
        Ok(Entry {
            id: repr.id,
            transaction: repr.transaction,
            account: repr.account,
            amount,
            currency: repr.currency,
            expected_version: repr.expected_version,
        })
    }
}

impl From<Entry> for EntryRepr {
    fn from(entry: Entry) -> Self {
        EntryRepr {
            id: entry.id,
            transaction: entry.transaction,
            account: entry.account,
            dr: entry.amount.dr_magnitude(),
            cr: entry.amount.cr_magnitude(),
            currency: entry.currency,
            expected_version: entry.expected_version,
        }
    }
}
