//! Daily Balance Repository

use super::RepoResult;
use chrono::NaiveDate;
use shared::models::DailyBalance;
use sqlx::SqliteExecutor;

#[derive(Debug, sqlx::FromRow)]
struct DailyBalanceRow {
    day: NaiveDate,
    balance_cents: i64,
    updated_at: i64,
}

impl From<DailyBalanceRow> for DailyBalance {
    fn from(row: DailyBalanceRow) -> Self {
        DailyBalance {
            day: row.day,
            balance_cents: row.balance_cents,
            updated_at: row.updated_at,
        }
    }
}

/// Atomically add `delta` to the day's balance, creating the row on first use
pub async fn upsert_add(
    exec: impl SqliteExecutor<'_>,
    day: NaiveDate,
    delta: i64,
    now: i64,
) -> RepoResult<()> {
    sqlx::query(
        "INSERT INTO daily_balance (day, balance_cents, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(day) DO UPDATE SET \
             balance_cents = balance_cents + excluded.balance_cents, \
             updated_at = excluded.updated_at",
    )
    .bind(day)
    .bind(delta)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_by_day(exec: impl SqliteExecutor<'_>, day: NaiveDate) -> RepoResult<Option<DailyBalance>> {
    let row = sqlx::query_as::<_, DailyBalanceRow>(
        "SELECT day, balance_cents, updated_at FROM daily_balance WHERE day = ?",
    )
    .bind(day)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(Into::into))
}

/// Stored rows within `[from, to]` ordered by day
pub async fn find_range(
    exec: impl SqliteExecutor<'_>,
    from: NaiveDate,
    to: NaiveDate,
    limit: i64,
    offset: i64,
) -> RepoResult<Vec<DailyBalance>> {
    let rows = sqlx::query_as::<_, DailyBalanceRow>(
        "SELECT day, balance_cents, updated_at FROM daily_balance \
         WHERE day BETWEEN ? AND ? ORDER BY day LIMIT ? OFFSET ?",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .bind(offset)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn delete_range(exec: impl SqliteExecutor<'_>, from: NaiveDate, to: NaiveDate) -> RepoResult<u64> {
    let result = sqlx::query("DELETE FROM daily_balance WHERE day BETWEEN ? AND ?")
        .bind(from)
        .bind(to)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
