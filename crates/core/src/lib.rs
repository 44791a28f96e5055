//! `tally-core`: ledger foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no storage concerns):
//! identifiers, the shared error model, and telemetry setup.

pub mod error;
pub mod id;
pub mod telemetry;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, EntryId, TransactionId};
