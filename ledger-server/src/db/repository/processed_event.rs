//! Processed Event Repository (dedup markers)

use super::RepoResult;
use chrono::NaiveDate;
use sqlx::SqliteExecutor;

/// Record `event_id` as applied. Returns false if it already was.
pub async fn insert_if_absent(
    exec: impl SqliteExecutor<'_>,
    event_id: &str,
    now: i64,
) -> RepoResult<bool> {
    let result = sqlx::query(
        "INSERT INTO processed_events (event_id, processed_at) VALUES (?, ?) \
         ON CONFLICT(event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn exists(exec: impl SqliteExecutor<'_>, event_id: &str) -> RepoResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM processed_events WHERE event_id = ?")
        .bind(event_id)
        .fetch_optional(exec)
        .await?;
    Ok(found.is_some())
}

/// Remove the markers of every entry dated within `[from, to]`
pub async fn delete_for_entries_between(
    exec: impl SqliteExecutor<'_>,
    from: NaiveDate,
    to: NaiveDate,
) -> RepoResult<u64> {
    let result = sqlx::query(
        "DELETE FROM processed_events WHERE event_id IN \
         (SELECT id FROM entries WHERE occurred_on BETWEEN ? AND ?)",
    )
    .bind(from)
    .bind(to)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}
