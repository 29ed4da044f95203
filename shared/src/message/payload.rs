//! Ledger event payloads

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, ErrorCode};

/// Aggregate tag of outbox records produced by the entry recorder
pub const ENTRY_AGGREGATE: &str = "Entry";
/// Event type, doubles as the routing key
pub const ENTRY_RECORDED_EVENT: &str = "ledger.entry-recorded";
/// Current payload schema version
pub const EVENT_VERSION: u32 = 1;

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "CREDIT",
            EntryType::Debit => "DEBIT",
        }
    }

    /// Signed delta for a positive amount: credits add, debits subtract.
    pub fn signed_amount(&self, amount_cents: i64) -> Result<i64, AppError> {
        if amount_cents <= 0 {
            return Err(AppError::invalid_amount(amount_cents));
        }
        Ok(match self {
            EntryType::Credit => amount_cents,
            EntryType::Debit => -amount_cents,
        })
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(EntryType::Credit),
            "DEBIT" => Ok(EntryType::Debit),
            other => Err(AppError::with_message(
                ErrorCode::InvalidFormat,
                format!("Unknown entry type: {other}"),
            )),
        }
    }
}

/// `ledger.entry-recorded` wire payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRecordedPayload {
    pub id: String,
    pub occurred_on: NaiveDate,
    pub amount_cents: i64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub description: String,
}
