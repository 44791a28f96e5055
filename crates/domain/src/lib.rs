//! `tally-domain`: double-entry ledger domain model.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod account;
pub mod currency;
pub mod entry;
pub mod transaction;
pub mod validate;

pub use account::{Account, AccountName, Normal};
pub use currency::CurrencyCode;
pub use entry::{Entry, EntryAmount};
pub use transaction::Transaction;
pub use validate::{generate_missing_entry, validate, Violation};
