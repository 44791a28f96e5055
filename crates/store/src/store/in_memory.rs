use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Utc;
use rust_decimal::Decimal;

use tally_core::{AccountId, EntryId, TransactionId};
use tally_domain::{Account, CurrencyCode, Entry, Transaction};

use super::query::{AccountFilter, CurrencyFilter, OrderBy, SearchParams, TransactionFilter};
use super::r#trait::{signed_balance, AccountBalances, LedgerStore, StoreError};

const CURRENCY_ORDER_FIELDS: &[&str] = &["code"];
const ACCOUNT_ORDER_FIELDS: &[&str] = &["id", "name", "number", "normal", "version"];
const TRANSACTION_ORDER_FIELDS: &[&str] = &["id", "posted", "effective", "memo"];

#[derive(Debug, Default)]
struct Tables {
    currencies: BTreeSet<CurrencyCode>,
    accounts: HashMap<AccountId, Account>,
    /// Transaction headers; entries live in `entries`, in post order.
    transactions: Vec<Transaction>,
    entries: Vec<Entry>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. The whole store sits behind one `RwLock`;
/// `post_transaction` stages every row first and mutates only after all
/// checks pass, so a failed posting leaves nothing behind.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

fn check_order_fields(orderby: &[OrderBy], allowed: &[&str]) -> Result<(), StoreError> {
    for term in orderby {
        if !allowed.contains(&term.field.as_str()) {
            return Err(StoreError::Storage(format!(
                "unknown order field: {}",
                term.field
            )));
        }
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, params: &SearchParams) -> Vec<T> {
    items
        .into_iter()
        .skip(params.offset.unwrap_or(0) as usize)
        .take(params.effective_limit() as usize)
        .collect()
}

fn account_matches(filter: &AccountFilter, account: &Account) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&account.id) {
            return false;
        }
    }
    if let Some(name) = &filter.name {
        if !account
            .name
            .as_str()
            .to_lowercase()
            .contains(&name.to_lowercase())
        {
            return false;
        }
    }
    if let Some(parent) = &filter.parent {
        if account.parent_id.as_ref() != Some(parent) {
            return false;
        }
    }
    if let Some(number) = filter.number {
        if account.number != Some(number) {
            return false;
        }
    }
    if let Some(normal) = filter.normal {
        if account.normal != normal {
            return false;
        }
    }
    if let Some(version) = &filter.version {
        if account.version.as_ref() != Some(version) {
            return false;
        }
    }
    true
}

fn order_accounts(accounts: &mut [Account], orderby: &[OrderBy]) {
    accounts.sort_by(|a, b| {
        for term in orderby {
            let ord = match term.field.as_str() {
                "id" => a.id.cmp(&b.id),
                "name" => a.name.as_str().cmp(b.name.as_str()),
                "number" => a.number.cmp(&b.number),
                "normal" => a.normal.unit().cmp(&b.normal.unit()),
                "version" => a.version.cmp(&b.version),
                _ => unreachable!("order fields are checked before sorting"),
            };
            let ord = if term.descending { ord.reverse() } else { ord };
            if !ord.is_eq() {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });
}

fn order_transactions(transactions: &mut [Transaction], orderby: &[OrderBy]) {
    transactions.sort_by(|a, b| {
        for term in orderby {
            let ord = match term.field.as_str() {
                "id" => a.id.cmp(&b.id),
                "posted" => a.posted.cmp(&b.posted),
                "effective" => a.effective.cmp(&b.effective),
                "memo" => a.memo.cmp(&b.memo),
                _ => unreachable!("order fields are checked before sorting"),
            };
            let ord = if term.descending { ord.reverse() } else { ord };
            if !ord.is_eq() {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_currency(&self, code: &CurrencyCode) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if !tables.currencies.insert(code.clone()) {
            return Err(StoreError::Constraint(format!(
                "currency already registered: {code}"
            )));
        }
        Ok(())
    }

    async fn find_currencies(
        &self,
        filter: &CurrencyFilter,
        params: &SearchParams,
    ) -> Result<Vec<CurrencyCode>, StoreError> {
        check_order_fields(&params.orderby, CURRENCY_ORDER_FIELDS)?;
        let tables = self.tables.read().map_err(poisoned)?;
        let mut codes: Vec<CurrencyCode> = tables
            .currencies
            .iter()
            .filter(|code| match &filter.codes {
                Some(wanted) => wanted.contains(code),
                None => true,
            })
            .cloned()
            .collect();
        // The set iterates ascending by code; the only orderable field is
        // `code`, so descending is a reversal.
        if params.orderby.iter().any(|term| term.descending) {
            codes.reverse();
        }
        Ok(paginate(codes, params))
    }

    async fn upsert_account(&self, account: &Account) -> Result<Account, StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if let Some(parent) = &account.parent_id {
            if !tables.accounts.contains_key(parent) {
                return Err(StoreError::Constraint(format!(
                    "parent account not found: {parent}"
                )));
            }
        }
        let stored = tables
            .accounts
            .entry(account.id)
            .and_modify(|existing| {
                // Everything but `version` is caller-editable; the version
                // token advances only through postings.
                existing.parent_id = account.parent_id;
                existing.name = account.name.clone();
                existing.normal = account.normal;
                existing.number = account.number;
            })
            .or_insert_with(|| Account {
                version: None,
                ..account.clone()
            });
        Ok(stored.clone())
    }

    async fn find_accounts(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<Account>, StoreError> {
        check_order_fields(&params.orderby, ACCOUNT_ORDER_FIELDS)?;
        let tables = self.tables.read().map_err(poisoned)?;
        let mut accounts: Vec<Account> = tables
            .accounts
            .values()
            .filter(|a| account_matches(filter, a))
            .cloned()
            .collect();
        order_accounts(&mut accounts, &params.orderby);
        Ok(paginate(accounts, params))
    }

    async fn post_transaction(&self, tx: Transaction) -> Result<Transaction, StoreError> {
        let mut tables = self.tables.write().map_err(poisoned)?;

        let tx_id = tx.id.unwrap_or_else(TransactionId::new);
        if tables.transactions.iter().any(|t| t.id == Some(tx_id)) {
            // Mirrors the primary-key rejection of the Postgres backend.
            return Err(StoreError::Constraint(format!(
                "duplicate transaction id: {tx_id}"
            )));
        }
        let posted = tx.posted.unwrap_or_else(Utc::now);

        // Stage everything first; nothing is applied until every entry has
        // passed its checks, which is what makes a failed posting invisible.
        let mut chained_versions: HashMap<AccountId, EntryId> = HashMap::new();
        let mut staged: Vec<Entry> = Vec::with_capacity(tx.entries.len());

        for entry in &tx.entries {
            let account = tables
                .accounts
                .get(&entry.account)
                .ok_or(StoreError::AccountNotFound(entry.account))?;

            if !tables.currencies.contains(&entry.currency) {
                return Err(StoreError::Constraint(format!(
                    "entry currency is not registered: {}",
                    entry.currency
                )));
            }

            // An earlier entry of this same call may already have advanced
            // the account; the optimistic check chains against that, not
            // against the pre-transaction state.
            let current = chained_versions
                .get(&entry.account)
                .copied()
                .or(account.version);

            if let Some(expected) = entry.expected_version {
                if current != Some(expected) {
                    return Err(StoreError::OptimisticLockConflict {
                        account: entry.account,
                        expected,
                        found: current,
                    });
                }
            }

            let entry_id = EntryId::new();
            chained_versions.insert(entry.account, entry_id);
            staged.push(Entry {
                id: Some(entry_id),
                transaction: Some(tx_id),
                expected_version: None,
                ..entry.clone()
            });
        }

        // Apply.
        for (account_id, version) in &chained_versions {
            if let Some(account) = tables.accounts.get_mut(account_id) {
                account.version = Some(*version);
            }
        }
        tables.entries.extend(staged.iter().cloned());

        let posted_tx = Transaction {
            id: Some(tx_id),
            posted: Some(posted),
            effective: tx.effective,
            memo: tx.memo,
            meta: tx.meta,
            entries: staged,
        };
        tables.transactions.push(Transaction {
            entries: Vec::new(),
            ..posted_tx.clone()
        });

        Ok(posted_tx)
    }

    async fn find_transactions(
        &self,
        filter: &TransactionFilter,
        params: &SearchParams,
    ) -> Result<Vec<Transaction>, StoreError> {
        check_order_fields(&params.orderby, TRANSACTION_ORDER_FIELDS)?;
        let tables = self.tables.read().map_err(poisoned)?;

        let entry_matches = |tx_id: Option<TransactionId>, entry: &Entry| {
            entry.transaction == tx_id
        };

        let mut matched: Vec<Transaction> = tables
            .transactions
            .iter()
            .filter(|tx| {
                if let Some(ids) = &filter.ids {
                    if !tx.id.is_some_and(|id| ids.contains(&id)) {
                        return false;
                    }
                }
                if let Some(memo) = &filter.memo {
                    let matches = tx
                        .memo
                        .as_ref()
                        .is_some_and(|m| m.to_lowercase().contains(&memo.to_lowercase()));
                    if !matches {
                        return false;
                    }
                }
                if let Some(currency) = &filter.currency {
                    let has = tables
                        .entries
                        .iter()
                        .any(|e| entry_matches(tx.id, e) && e.currency == *currency);
                    if !has {
                        return false;
                    }
                }
                if let Some(account) = &filter.account {
                    let has = tables
                        .entries
                        .iter()
                        .any(|e| entry_matches(tx.id, e) && e.account == *account);
                    if !has {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        order_transactions(&mut matched, &params.orderby);
        let mut page = paginate(matched, params);

        // Collate entries under their transactions, in post order.
        for tx in &mut page {
            tx.entries = tables
                .entries
                .iter()
                .filter(|e| entry_matches(tx.id, e))
                .cloned()
                .collect();
        }
        Ok(page)
    }

    async fn account_balances(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<AccountBalances>, StoreError> {
        check_order_fields(&params.orderby, ACCOUNT_ORDER_FIELDS)?;
        let tables = self.tables.read().map_err(poisoned)?;

        // Filter/order/paginate the account dimension before aggregating.
        let mut accounts: Vec<Account> = tables
            .accounts
            .values()
            .filter(|a| account_matches(filter, a))
            .cloned()
            .collect();
        order_accounts(&mut accounts, &params.orderby);
        let accounts = paginate(accounts, params);

        let mut results = Vec::new();
        for account in accounts {
            let mut sums: BTreeMap<CurrencyCode, (Decimal, Decimal)> = BTreeMap::new();
            for entry in tables.entries.iter().filter(|e| e.account == account.id) {
                let (dr, cr) = sums.entry(entry.currency.clone()).or_default();
                *dr += entry.amount.dr_magnitude().unwrap_or(Decimal::ZERO);
                *cr += entry.amount.cr_magnitude().unwrap_or(Decimal::ZERO);
            }
            if sums.is_empty() {
                // Inner-join semantics: accounts with no entries are omitted.
                continue;
            }
            let balances = sums
                .into_iter()
                .map(|(currency, (dr, cr))| (currency, signed_balance(dr, cr, account.normal)))
                .collect();
            results.push(AccountBalances { account, balances });
        }
        Ok(results)
    }
}
