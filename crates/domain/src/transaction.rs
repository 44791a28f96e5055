//! Transactions: atomically-posted, immutable groups of balanced entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tally_core::TransactionId;

use crate::entry::Entry;

/// A candidate or posted transaction.
///
/// `id` and `posted` are filled by the posting engine. Entry order is not
/// semantically significant, but entries are inserted in list order so that
/// version chaining is deterministic when several entries touch the same
/// account. Posted transactions are never updated or deleted; corrections
/// are new transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonValue>,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Transaction {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            id: None,
            posted: None,
            effective: None,
            memo: None,
            meta: None,
            entries,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_effective(mut self, effective: DateTime<Utc>) -> Self {
        self.effective = Some(effective);
        self
    }
}
