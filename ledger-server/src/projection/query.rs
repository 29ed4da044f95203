use chrono::NaiveDate;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{BalancePoint, DateRange, MAX_RANGE_DAYS};
use sqlx::SqlitePool;

use crate::db::repository::daily_balance;

/// Read side of the projection
#[derive(Clone)]
pub struct BalanceQueryService {
    pool: SqlitePool,
}

impl BalanceQueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Balance of one day; days without activity read as zero
    pub async fn daily(&self, day: NaiveDate) -> AppResult<BalancePoint> {
        let row = daily_balance::find_by_day(&self.pool, day).await?;
        Ok(row.map(BalancePoint::from).unwrap_or_else(|| BalancePoint::zero(day)))
    }

    /// Stored days in `[from, to]`, sorted by day
    pub async fn range(&self, from: NaiveDate, to: NaiveDate) -> AppResult<Vec<BalancePoint>> {
        self.range_page(from, to, 0, MAX_RANGE_DAYS).await
    }

    /// One page of [`range`](Self::range); `size` must be within `1..=366`
    pub async fn range_page(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        page: i64,
        size: i64,
    ) -> AppResult<Vec<BalancePoint>> {
        let range = DateRange::new(from, to)?;
        if !(1..=MAX_RANGE_DAYS).contains(&size) {
            return Err(AppError::with_message(
                ErrorCode::ValueOutOfRange,
                format!("page size must be between 1 and {MAX_RANGE_DAYS}"),
            )
            .with_detail("size", size));
        }
        if page < 0 {
            return Err(AppError::with_message(ErrorCode::ValueOutOfRange, "page must not be negative")
                .with_detail("page", page));
        }

        let rows = daily_balance::find_range(
            &self.pool,
            range.from(),
            range.to(),
            size,
            page.saturating_mul(size),
        )
        .await?;
        Ok(rows.into_iter().map(BalancePoint::from).collect())
    }
}
