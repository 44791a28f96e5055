//! `tally-store`: persistence for the double-entry ledger.
//!
//! Exposes the [`LedgerStore`] trait (the posting engine and balance query
//! engine live behind it), an in-memory backend for tests/dev, and a
//! Postgres backend built on sqlx.

pub mod store;

pub use store::{
    AccountBalances, AccountFilter, CurrencyFilter, InMemoryLedgerStore, LedgerStore, OrderBy,
    PgConfig, PgLedgerStore, SearchParams, StoreError, TransactionFilter,
};
