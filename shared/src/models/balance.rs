//! Daily Balance Model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorCode};
use crate::util::inclusive_days;

/// Largest inclusive span accepted by range queries and rebuilds
pub const MAX_RANGE_DAYS: i64 = 366;

/// Stored projection row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBalance {
    pub day: NaiveDate,
    pub balance_cents: i64,
    pub updated_at: i64,
}

/// Balance read model `{day, balanceCents}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancePoint {
    pub day: NaiveDate,
    pub balance_cents: i64,
}

impl BalancePoint {
    /// Balance of a day with no recorded activity
    pub fn zero(day: NaiveDate) -> Self {
        Self {
            day,
            balance_cents: 0,
        }
    }
}

impl From<DailyBalance> for BalancePoint {
    fn from(row: DailyBalance) -> Self {
        Self {
            day: row.day,
            balance_cents: row.balance_cents,
        }
    }
}

/// Validated inclusive date range `[from, to]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DateRange {
    /// Rejects `from > to` and spans over [`MAX_RANGE_DAYS`]
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, AppError> {
        if from > to {
            return Err(AppError::with_message(
                ErrorCode::InvalidDateRange,
                format!("from ({from}) must not be after to ({to})"),
            ));
        }
        let days = inclusive_days(from, to);
        if days > MAX_RANGE_DAYS {
            return Err(AppError::with_message(
                ErrorCode::RangeTooLarge,
                format!("range spans {days} days, at most {MAX_RANGE_DAYS} allowed"),
            )
            .with_detail("days", days));
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    pub fn days(&self) -> i64 {
        inclusive_days(self.from, self.to)
    }
}
