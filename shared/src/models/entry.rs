//! Ledger Entry Model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::message::{EntryRecordedPayload, EntryType};

/// Maximum length of an idempotency key
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 64;
/// Maximum length of an entry description
pub const MAX_DESCRIPTION_LEN: usize = 255;

/// Source-of-truth economic entry, immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub occurred_on: NaiveDate,
    /// Always positive, direction is carried by `entry_type`
    pub amount_cents: i64,
    pub entry_type: EntryType,
    pub description: String,
    pub idempotency_key: String,
    pub created_at: i64,
}

impl Entry {
    /// Wire payload mirroring this entry
    pub fn to_payload(&self) -> EntryRecordedPayload {
        EntryRecordedPayload {
            id: self.id.clone(),
            occurred_on: self.occurred_on,
            amount_cents: self.amount_cents,
            entry_type: self.entry_type,
            description: self.description.clone(),
        }
    }
}

/// Record entry command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEntry {
    pub occurred_on: NaiveDate,
    pub amount_cents: i64,
    pub entry_type: EntryType,
    #[serde(default)]
    pub description: String,
    pub idempotency_key: String,
    /// Originating request id, forwarded as a message header
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Result of a record call
///
/// `created = false` means the idempotency key was replayed and `id` is the
/// entry created by the first submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: String,
    pub created: bool,
}
