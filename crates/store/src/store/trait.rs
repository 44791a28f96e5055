use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use tally_core::{AccountId, EntryId};
use tally_domain::{Account, CurrencyCode, Transaction};

use super::query::{AccountFilter, CurrencyFilter, SearchParams, TransactionFilter};

/// Store operation error.
///
/// These are referential, concurrency, and storage failures. Structural
/// validation ([`tally_domain::validate`]) happens before the store is ever
/// involved and is not re-run here.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An entry referenced an account that does not exist.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// An entry's expected version did not match the account's current
    /// version. The caller should re-read and retry with fresh versions.
    #[error("optimistic lock conflict on account {account}: expected {expected}, found {found:?}")]
    OptimisticLockConflict {
        account: AccountId,
        expected: EntryId,
        found: Option<EntryId>,
    },

    /// A uniqueness or referential constraint was violated (duplicate
    /// currency code, unknown currency on an entry).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-account, per-currency net balances, rendered positive on the
/// account's normal side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalances {
    pub account: Account,
    pub balances: BTreeMap<CurrencyCode, Decimal>,
}

/// Render one (account, currency) group as a signed balance:
/// `(sum(dr) - sum(cr)) * normal`, so a DR-normal account with a net debit
/// displays positive, and a CR-normal account with a net credit displays
/// positive.
pub(crate) fn signed_balance(
    dr_sum: Decimal,
    cr_sum: Decimal,
    normal: tally_domain::Normal,
) -> Decimal {
    (dr_sum - cr_sum) * normal.unit()
}

/// The ledger's narrow storage interface.
///
/// ## Design principles
///
/// - **Append-only postings**: transactions and entries are inserted exactly
///   once and never updated or deleted; corrections are new transactions.
/// - **Optimistic locking**: the only write-time concurrency control is the
///   per-account version token, checked when an entry opts in. No locks are
///   taken proactively (compare-and-fail, not compare-and-block).
/// - **Atomicity**: `post_transaction` is a single unit of work; a failure at
///   any step leaves no orphan headers and no partial entries visible.
///
/// ## Posting semantics
///
/// `post_transaction()` trusts structurally validated input (the caller runs
/// `tally_domain::validate` first) and, within one atomic unit of work:
/// 1. inserts the transaction header, generating its id;
/// 2. for each entry in input order: resolves the account's current version
///    (preferring the version set by an earlier entry of this same call, so
///    entries chain against each other), applies the opt-in expected-version
///    check, inserts the entry, and advances the account version to the new
///    entry id;
/// 3. commits and returns the transaction with entries in insertion order.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Register a currency code. Duplicate registration is a `Constraint`
    /// error.
    async fn create_currency(&self, code: &CurrencyCode) -> Result<(), StoreError>;

    /// List registered currencies, ascending by code unless `params.orderby`
    /// says otherwise (`code` is the only orderable field).
    async fn find_currencies(
        &self,
        filter: &CurrencyFilter,
        params: &SearchParams,
    ) -> Result<Vec<CurrencyCode>, StoreError>;

    /// Create or update an account by id. Accounts are never deleted, and
    /// the stored `version` is preserved: only the posting engine advances
    /// it. Returns the stored account.
    async fn upsert_account(&self, account: &Account) -> Result<Account, StoreError>;

    /// Search accounts.
    async fn find_accounts(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<Account>, StoreError>;

    /// Atomically post a validated transaction (see trait docs).
    async fn post_transaction(&self, tx: Transaction) -> Result<Transaction, StoreError>;

    /// Search posted transactions; each result carries all of its entries in
    /// insertion order, even when the filter matched on an entry attribute.
    async fn find_transactions(
        &self,
        filter: &TransactionFilter,
        params: &SearchParams,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Aggregate posted entries into per-account, per-currency balances.
    /// Accounts with no entries are omitted. Filtering, ordering, and
    /// pagination apply to the account dimension before aggregation.
    async fn account_balances(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<AccountBalances>, StoreError>;
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn create_currency(&self, code: &CurrencyCode) -> Result<(), StoreError> {
        (**self).create_currency(code).await
    }

    async fn find_currencies(
        &self,
        filter: &CurrencyFilter,
        params: &SearchParams,
    ) -> Result<Vec<CurrencyCode>, StoreError> {
        (**self).find_currencies(filter, params).await
    }

    async fn upsert_account(&self, account: &Account) -> Result<Account, StoreError> {
        (**self).upsert_account(account).await
    }

    async fn find_accounts(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<Account>, StoreError> {
        (**self).find_accounts(filter, params).await
    }

    async fn post_transaction(&self, tx: Transaction) -> Result<Transaction, StoreError> {
        (**self).post_transaction(tx).await
    }

    async fn find_transactions(
        &self,
        filter: &TransactionFilter,
        params: &SearchParams,
    ) -> Result<Vec<Transaction>, StoreError> {
        (**self).find_transactions(filter, params).await
    }

    async fn account_balances(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<AccountBalances>, StoreError> {
        (**self).account_balances(filter, params).await
    }
}
