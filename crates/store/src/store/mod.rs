//! Ledger storage: the narrow store interface plus its backends.

pub mod in_memory;
pub mod postgres;
pub mod query;
mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::{PgConfig, PgLedgerStore};
pub use query::{AccountFilter, CurrencyFilter, OrderBy, SearchParams, TransactionFilter};
pub use r#trait::{AccountBalances, LedgerStore, StoreError};
