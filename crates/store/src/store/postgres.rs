//! Postgres-backed ledger store.
//!
//! Posting runs inside a database transaction. The version lookup takes a
//! row lock (`SELECT ... FOR UPDATE`), so concurrent postings that touch
//! disjoint accounts proceed in parallel while postings against the same
//! account serialize: the second reads the version the first committed and,
//! if it carried an expected version, fails the optimistic check.
//!
//! ## Error mapping
//!
//! | PostgreSQL error code | StoreError | Scenario |
//! |---|---|---|
//! | `23505` (unique) | `Constraint` | duplicate currency code |
//! | `23503` (foreign key) | `Constraint` | unknown currency on an entry |
//! | `23514` (check) | `Constraint` | dr/cr shape or positivity violated |
//! | anything else | `Storage` | network, pool, decode failures |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use tally_core::{AccountId, EntryId, TransactionId};
use tally_domain::{Account, AccountName, CurrencyCode, Entry, EntryAmount, Transaction};

use super::query::{AccountFilter, CurrencyFilter, OrderBy, SearchParams, TransactionFilter};
use super::r#trait::{signed_balance, AccountBalances, LedgerStore, StoreError};

const CURRENCY_ORDER_FIELDS: &[&str] = &["code"];
const ACCOUNT_ORDER_FIELDS: &[&str] = &["id", "name", "number", "normal", "version"];
const TRANSACTION_ORDER_FIELDS: &[&str] = &["id", "posted", "effective", "memo"];

/// Connection settings, passed explicitly at construction (no process-global
/// configuration).
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub url: String,
    pub max_connections: u32,
}

impl PgConfig {
    /// Read `DATABASE_URL` (and optional `DATABASE_MAX_CONNECTIONS`) from the
    /// environment, in one place.
    pub fn from_env() -> Result<Self, StoreError> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::Storage("DATABASE_URL is not set".to_string()))?;
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        Ok(Self {
            url,
            max_connections,
        })
    }
}

/// Postgres-backed ledger store.
///
/// Clone-cheap (the pool is shared); `Send + Sync`.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: Arc<PgPool>,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(config: &PgConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the ledger schema if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS currency (
        code text PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account (
        id uuid PRIMARY KEY,
        parent_id uuid REFERENCES account (id),
        name text NOT NULL,
        normal text NOT NULL CHECK (normal IN ('DR', 'CR')),
        number integer,
        version uuid
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transaction (
        id uuid PRIMARY KEY,
        posted timestamptz NOT NULL DEFAULT now(),
        effective timestamptz,
        memo text,
        meta jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entry (
        id uuid PRIMARY KEY,
        seq bigint GENERATED ALWAYS AS IDENTITY,
        tx uuid NOT NULL REFERENCES transaction (id),
        acct uuid NOT NULL REFERENCES account (id),
        dr numeric,
        cr numeric,
        curr text NOT NULL REFERENCES currency (code),
        CHECK (num_nonnulls(dr, cr) = 1),
        CHECK (coalesce(dr, cr) > 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS entry_tx_idx ON entry (tx)",
    "CREATE INDEX IF NOT EXISTS entry_acct_idx ON entry (acct)",
];

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, first: &mut bool) {
    qb.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

fn push_order(
    qb: &mut QueryBuilder<'_, Postgres>,
    orderby: &[OrderBy],
    allowed: &[&str],
    prefix: &str,
) -> Result<(), StoreError> {
    if orderby.is_empty() {
        return Ok(());
    }
    qb.push(" ORDER BY ");
    for (i, term) in orderby.iter().enumerate() {
        if !allowed.contains(&term.field.as_str()) {
            return Err(StoreError::Storage(format!(
                "unknown order field: {}",
                term.field
            )));
        }
        if i > 0 {
            qb.push(", ");
        }
        // Field names are whitelisted above, so pushing them raw is safe.
        qb.push(format!("{prefix}{}", term.field));
        if term.descending {
            qb.push(" DESC");
        }
    }
    Ok(())
}

fn push_page(qb: &mut QueryBuilder<'_, Postgres>, params: &SearchParams) {
    qb.push(" LIMIT ");
    qb.push_bind(params.effective_limit() as i64);
    if let Some(offset) = params.offset {
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);
    }
}

fn push_account_filters(
    qb: &mut QueryBuilder<'_, Postgres>,
    filter: &AccountFilter,
    first: &mut bool,
) {
    if let Some(ids) = &filter.ids {
        push_where(qb, first);
        qb.push("id = ANY(");
        qb.push_bind(ids.iter().map(|id| *id.as_uuid()).collect::<Vec<Uuid>>());
        qb.push(")");
    }
    if let Some(name) = &filter.name {
        push_where(qb, first);
        qb.push("name ILIKE ");
        qb.push_bind(format!("%{name}%"));
    }
    if let Some(parent) = &filter.parent {
        push_where(qb, first);
        qb.push("parent_id = ");
        qb.push_bind(*parent.as_uuid());
    }
    if let Some(number) = filter.number {
        push_where(qb, first);
        qb.push("number = ");
        qb.push_bind(number);
    }
    if let Some(normal) = filter.normal {
        push_where(qb, first);
        qb.push("normal = ");
        qb.push_bind(normal.to_string());
    }
    if let Some(version) = &filter.version {
        push_where(qb, first);
        qb.push("version = ");
        qb.push_bind(*version.as_uuid());
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode account row", e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let parent_id: Option<Uuid> = row.try_get("parent_id").map_err(decode)?;
    let name: String = row.try_get("name").map_err(decode)?;
    let normal: String = row.try_get("normal").map_err(decode)?;
    let number: Option<i32> = row.try_get("number").map_err(decode)?;
    let version: Option<Uuid> = row.try_get("version").map_err(decode)?;

    Ok(Account {
        id: AccountId::from_uuid(id),
        parent_id: parent_id.map(AccountId::from_uuid),
        name: AccountName::parse(name).map_err(|e| StoreError::Storage(e.to_string()))?,
        normal: normal
            .parse()
            .map_err(|e: tally_core::DomainError| StoreError::Storage(e.to_string()))?,
        number,
        version: version.map(EntryId::from_uuid),
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode entry row", e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let tx: Uuid = row.try_get("tx").map_err(decode)?;
    let acct: Uuid = row.try_get("acct").map_err(decode)?;
    let dr: Option<Decimal> = row.try_get("dr").map_err(decode)?;
    let cr: Option<Decimal> = row.try_get("cr").map_err(decode)?;
    let curr: String = row.try_get("curr").map_err(decode)?;

    let amount = match (dr, cr) {
        (Some(dr), None) => EntryAmount::dr(dr),
        (None, Some(cr)) => EntryAmount::cr(cr),
        _ => Err(tally_core::DomainError::invariant(
            "entry row must carry exactly one of dr/cr",
        )),
    }
    .map_err(|e| StoreError::Storage(e.to_string()))?;

    Ok(Entry {
        id: Some(EntryId::from_uuid(id)),
        transaction: Some(TransactionId::from_uuid(tx)),
        account: AccountId::from_uuid(acct),
        amount,
        currency: CurrencyCode::parse(curr).map_err(|e| StoreError::Storage(e.to_string()))?,
        expected_version: None,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode transaction row", e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let posted: DateTime<Utc> = row.try_get("posted").map_err(decode)?;
    let effective: Option<DateTime<Utc>> = row.try_get("effective").map_err(decode)?;
    let memo: Option<String> = row.try_get("memo").map_err(decode)?;
    let meta: Option<serde_json::Value> = row.try_get("meta").map_err(decode)?;

    Ok(Transaction {
        id: Some(TransactionId::from_uuid(id)),
        posted: Some(posted),
        effective,
        memo,
        meta,
        entries: Vec::new(),
    })
}

#[async_trait::async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self), fields(code = %code), err)]
    async fn create_currency(&self, code: &CurrencyCode) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO currency (code) VALUES ($1)")
            .bind(code.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_currency", e))?;
        Ok(())
    }

    #[instrument(skip(self, filter, params), err)]
    async fn find_currencies(
        &self,
        filter: &CurrencyFilter,
        params: &SearchParams,
    ) -> Result<Vec<CurrencyCode>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT code FROM currency");
        if let Some(codes) = &filter.codes {
            qb.push(" WHERE code = ANY(");
            qb.push_bind(
                codes
                    .iter()
                    .map(|c| c.as_str().to_string())
                    .collect::<Vec<String>>(),
            );
            qb.push(")");
        }
        if params.orderby.is_empty() {
            qb.push(" ORDER BY code");
        } else {
            push_order(&mut qb, &params.orderby, CURRENCY_ORDER_FIELDS, "")?;
        }
        push_page(&mut qb, params);

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_currencies", e))?;

        rows.iter()
            .map(|row| {
                let code: String = row
                    .try_get("code")
                    .map_err(|e| map_sqlx_error("decode currency row", e))?;
                CurrencyCode::parse(code).map_err(|e| StoreError::Storage(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self, account), fields(account_id = %account.id), err)]
    async fn upsert_account(&self, account: &Account) -> Result<Account, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO account (id, parent_id, name, normal, number, version)
            VALUES ($1, $2, $3, $4, $5, NULL)
            ON CONFLICT (id) DO UPDATE SET
                parent_id = EXCLUDED.parent_id,
                name = EXCLUDED.name,
                normal = EXCLUDED.normal,
                number = EXCLUDED.number
            RETURNING id, parent_id, name, normal, number, version
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.parent_id.map(|p| *p.as_uuid()))
        .bind(account.name.as_str())
        .bind(account.normal.to_string())
        .bind(account.number)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_account", e))?;

        account_from_row(&row)
    }

    #[instrument(skip(self, filter, params), err)]
    async fn find_accounts(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<Account>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, parent_id, name, normal, number, version FROM account",
        );
        let mut first = true;
        push_account_filters(&mut qb, filter, &mut first);
        push_order(&mut qb, &params.orderby, ACCOUNT_ORDER_FIELDS, "")?;
        push_page(&mut qb, params);

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_accounts", e))?;
        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self, tx), fields(entry_count = tx.entries.len()), err)]
    async fn post_transaction(&self, tx: Transaction) -> Result<Transaction, StoreError> {
        let mut dbtx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let tx_id = tx.id.unwrap_or_else(TransactionId::new);
        let posted = tx.posted.unwrap_or_else(Utc::now);

        sqlx::query(
            "INSERT INTO transaction (id, posted, effective, memo, meta) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(tx_id.as_uuid())
        .bind(posted)
        .bind(tx.effective)
        .bind(&tx.memo)
        .bind(&tx.meta)
        .execute(&mut *dbtx)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        // Versions advanced by earlier entries of this same call; the
        // optimistic check chains against these, not just the stored state.
        let mut chained_versions: HashMap<AccountId, EntryId> = HashMap::new();
        let mut posted_entries = Vec::with_capacity(tx.entries.len());

        for entry in tx.entries {
            // FOR UPDATE locks the account row: a concurrent posting to the
            // same account blocks here until this transaction commits, then
            // re-reads the advanced version and fails its expected-version
            // check instead of passing on a stale snapshot.
            let row = sqlx::query("SELECT version FROM account WHERE id = $1 FOR UPDATE")
                .bind(entry.account.as_uuid())
                .fetch_optional(&mut *dbtx)
                .await
                .map_err(|e| map_sqlx_error("select_account_version", e))?;

            let Some(row) = row else {
                dbtx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::AccountNotFound(entry.account));
            };
            let stored: Option<Uuid> = row
                .try_get("version")
                .map_err(|e| map_sqlx_error("decode account version", e))?;

            let current = chained_versions
                .get(&entry.account)
                .copied()
                .or(stored.map(EntryId::from_uuid));

            if let Some(expected) = entry.expected_version {
                if current != Some(expected) {
                    dbtx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(StoreError::OptimisticLockConflict {
                        account: entry.account,
                        expected,
                        found: current,
                    });
                }
            }

            let entry_id = EntryId::new();
            sqlx::query(
                "INSERT INTO entry (id, tx, acct, dr, cr, curr) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(entry_id.as_uuid())
            .bind(tx_id.as_uuid())
            .bind(entry.account.as_uuid())
            .bind(entry.amount.dr_magnitude())
            .bind(entry.amount.cr_magnitude())
            .bind(entry.currency.as_str())
            .execute(&mut *dbtx)
            .await
            .map_err(|e| map_sqlx_error("insert_entry", e))?;

            sqlx::query("UPDATE account SET version = $2 WHERE id = $1")
                .bind(entry.account.as_uuid())
                .bind(entry_id.as_uuid())
                .execute(&mut *dbtx)
                .await
                .map_err(|e| map_sqlx_error("update_account_version", e))?;

            chained_versions.insert(entry.account, entry_id);
            posted_entries.push(Entry {
                id: Some(entry_id),
                transaction: Some(tx_id),
                expected_version: None,
                ..entry
            });
        }

        dbtx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Transaction {
            id: Some(tx_id),
            posted: Some(posted),
            effective: tx.effective,
            memo: tx.memo,
            meta: tx.meta,
            entries: posted_entries,
        })
    }

    #[instrument(skip(self, filter, params), err)]
    async fn find_transactions(
        &self,
        filter: &TransactionFilter,
        params: &SearchParams,
    ) -> Result<Vec<Transaction>, StoreError> {
        // Resolve matching transaction ids first: entry-level filters select
        // the transaction, not a subset of its entries.
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT DISTINCT t.id FROM transaction t JOIN entry e ON t.id = e.tx",
        );
        let mut first = true;
        if let Some(ids) = &filter.ids {
            push_where(&mut qb, &mut first);
            qb.push("t.id = ANY(");
            qb.push_bind(ids.iter().map(|id| *id.as_uuid()).collect::<Vec<Uuid>>());
            qb.push(")");
        }
        if let Some(memo) = &filter.memo {
            push_where(&mut qb, &mut first);
            qb.push("t.memo ILIKE ");
            qb.push_bind(format!("%{memo}%"));
        }
        if let Some(currency) = &filter.currency {
            push_where(&mut qb, &mut first);
            qb.push("e.curr = ");
            qb.push_bind(currency.as_str().to_string());
        }
        if let Some(account) = &filter.account {
            push_where(&mut qb, &mut first);
            qb.push("e.acct = ");
            qb.push_bind(*account.as_uuid());
        }

        let id_rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_transactions", e))?;
        let tx_ids: Vec<Uuid> = id_rows
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("decode transaction id", e))?;
        if tx_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, posted, effective, memo, meta FROM transaction WHERE id = ANY(",
        );
        qb.push_bind(tx_ids.clone());
        qb.push(")");
        push_order(&mut qb, &params.orderby, TRANSACTION_ORDER_FIELDS, "")?;
        push_page(&mut qb, params);

        let tx_rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_transactions", e))?;
        let mut transactions: Vec<Transaction> = tx_rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<_, _>>()?;

        // Collate entries under their transactions, in insertion order.
        let entry_rows = sqlx::query(
            "SELECT id, tx, acct, dr, cr, curr FROM entry WHERE tx = ANY($1) ORDER BY seq",
        )
        .bind(&tx_ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_transaction_entries", e))?;

        let mut entries_by_tx: HashMap<TransactionId, Vec<Entry>> = HashMap::new();
        for row in &entry_rows {
            let entry = entry_from_row(row)?;
            if let Some(tx_id) = entry.transaction {
                entries_by_tx.entry(tx_id).or_default().push(entry);
            }
        }
        for tx in &mut transactions {
            if let Some(id) = tx.id {
                tx.entries = entries_by_tx.remove(&id).unwrap_or_default();
            }
        }
        Ok(transactions)
    }

    #[instrument(skip(self, filter, params), err)]
    async fn account_balances(
        &self,
        filter: &AccountFilter,
        params: &SearchParams,
    ) -> Result<Vec<AccountBalances>, StoreError> {
        // Filter/order/paginate accounts first, then aggregate their entries
        // per currency. Inner join: accounts with no entries drop out.
        let mut qb = QueryBuilder::<Postgres>::new(
            "WITH accts AS (SELECT id, parent_id, name, normal, number, version FROM account",
        );
        let mut first = true;
        push_account_filters(&mut qb, filter, &mut first);
        push_order(&mut qb, &params.orderby, ACCOUNT_ORDER_FIELDS, "")?;
        push_page(&mut qb, params);
        qb.push(
            r#"),
            sums AS (
                SELECT a.id account_id, e.curr, sum(e.dr) dr, sum(e.cr) cr
                FROM accts a
                JOIN entry e ON a.id = e.acct
                GROUP BY a.id, e.curr
            )
            SELECT accts.id, accts.parent_id, accts.name, accts.normal,
                accts.number, accts.version, sums.curr, sums.dr, sums.cr
            FROM accts
            JOIN sums ON accts.id = sums.account_id
            "#,
        );
        push_order(&mut qb, &params.orderby, ACCOUNT_ORDER_FIELDS, "accts.")?;

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_balances", e))?;

        // Collate per account, preserving the query's account order.
        let mut order: Vec<AccountId> = Vec::new();
        let mut collated: HashMap<AccountId, AccountBalances> = HashMap::new();
        for row in &rows {
            let account = account_from_row(row)?;
            let decode = |e: sqlx::Error| map_sqlx_error("decode balance row", e);
            let curr: String = row.try_get("curr").map_err(decode)?;
            let dr: Option<Decimal> = row.try_get("dr").map_err(decode)?;
            let cr: Option<Decimal> = row.try_get("cr").map_err(decode)?;

            let currency =
                CurrencyCode::parse(curr).map_err(|e| StoreError::Storage(e.to_string()))?;
            let balance = signed_balance(
                dr.unwrap_or(Decimal::ZERO),
                cr.unwrap_or(Decimal::ZERO),
                account.normal,
            );

            let id = account.id;
            let slot = collated.entry(id).or_insert_with(|| {
                order.push(id);
                AccountBalances {
                    account,
                    balances: BTreeMap::new(),
                }
            });
            slot.balances.insert(currency, balance);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| collated.remove(&id))
            .collect())
    }
}
