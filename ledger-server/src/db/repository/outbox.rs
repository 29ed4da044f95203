//! Outbox Repository
//!
//! Claiming is a lease: a single `UPDATE … WHERE id = (SELECT … LIMIT 1)`
//! stamps `lease_owner`/`lease_until` on the oldest eligible row. SQLite runs
//! the statement atomically, so two workers never hold the same row, and an
//! expired lease (crashed worker) makes the row claimable again.
//!
//! State transitions after a claim match on `lease_owner`; a worker that
//! lost its lease updates nothing.

use super::RepoResult;
use shared::models::{OutboxBacklog, OutboxRecord};
use sqlx::SqliteExecutor;

/// Base of the quadratic backoff (`attempts² × 5s`)
pub const BACKOFF_STEP_MS: i64 = 5_000;
/// Backoff ceiling
pub const BACKOFF_CAP_MS: i64 = 300_000;

/// Result of recording a failed publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: i64,
    pub poisoned: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: String,
    aggregate_type: String,
    event_type: String,
    payload: String,
    request_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    published_at: Option<i64>,
    attempts: i64,
    last_error: Option<String>,
    poisoned_at: Option<i64>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        OutboxRecord {
            id: row.id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            request_id: row.request_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            published_at: row.published_at,
            attempts: row.attempts,
            last_error: row.last_error,
            poisoned_at: row.poisoned_at,
        }
    }
}

const SELECT_OUTBOX: &str = "SELECT id, aggregate_type, event_type, payload, request_id, created_at, updated_at, published_at, attempts, last_error, poisoned_at FROM outbox";

/// Backoff window for a record that failed `attempts` times
pub fn backoff_ms(attempts: i64) -> i64 {
    attempts
        .saturating_mul(attempts)
        .saturating_mul(BACKOFF_STEP_MS)
        .min(BACKOFF_CAP_MS)
}

pub async fn insert(exec: impl SqliteExecutor<'_>, record: &OutboxRecord) -> RepoResult<()> {
    sqlx::query(
        "INSERT INTO outbox (id, aggregate_type, event_type, payload, request_id, created_at, updated_at, published_at, attempts, last_error, poisoned_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.aggregate_type)
    .bind(&record.event_type)
    .bind(&record.payload)
    .bind(&record.request_id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.published_at)
    .bind(record.attempts)
    .bind(&record.last_error)
    .bind(record.poisoned_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn find_by_id(exec: impl SqliteExecutor<'_>, id: &str) -> RepoResult<Option<OutboxRecord>> {
    let row = sqlx::query_as::<_, OutboxRow>(&format!("{SELECT_OUTBOX} WHERE id = ?"))
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(row.map(Into::into))
}

/// Still-pending record by id, `None` once published or poisoned
pub async fn find_pending(exec: impl SqliteExecutor<'_>, id: &str) -> RepoResult<Option<OutboxRecord>> {
    let row = sqlx::query_as::<_, OutboxRow>(&format!(
        "{SELECT_OUTBOX} WHERE id = ? AND published_at IS NULL AND poisoned_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(Into::into))
}

/// Lease the oldest eligible record to `owner` until `lease_until`.
///
/// Eligible: unpublished, not poisoned, lease free, and either never
/// attempted or idle for longer than [`backoff_ms`] of its attempts.
pub async fn claim_next(
    exec: impl SqliteExecutor<'_>,
    owner: &str,
    now: i64,
    lease_until: i64,
) -> RepoResult<Option<String>> {
    let id = sqlx::query_scalar(
        "UPDATE outbox SET lease_owner = ?1, lease_until = ?2 \
         WHERE id = ( \
             SELECT id FROM outbox \
             WHERE published_at IS NULL \
               AND poisoned_at IS NULL \
               AND (lease_until IS NULL OR lease_until <= ?3) \
               AND (attempts = 0 OR ?3 - updated_at > MIN(attempts * attempts * ?4, ?5)) \
             ORDER BY created_at, id \
             LIMIT 1 \
         ) \
         AND (lease_until IS NULL OR lease_until <= ?3) \
         RETURNING id",
    )
    .bind(owner)
    .bind(lease_until)
    .bind(now)
    .bind(BACKOFF_STEP_MS)
    .bind(BACKOFF_CAP_MS)
    .fetch_optional(exec)
    .await?;
    Ok(id)
}

/// Terminal success; returns false if the lease was lost
pub async fn mark_published(
    exec: impl SqliteExecutor<'_>,
    id: &str,
    owner: &str,
    now: i64,
) -> RepoResult<bool> {
    let result = sqlx::query(
        "UPDATE outbox SET published_at = ?1, updated_at = ?1, lease_owner = NULL, lease_until = NULL \
         WHERE id = ?2 AND lease_owner = ?3 AND published_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .bind(owner)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Count one failed attempt and poison the record once `max_attempts` is
/// reached, in one statement. `None` if the lease was lost.
pub async fn mark_failed(
    exec: impl SqliteExecutor<'_>,
    id: &str,
    owner: &str,
    error: &str,
    max_attempts: i64,
    now: i64,
) -> RepoResult<Option<FailureOutcome>> {
    let row: Option<(i64, Option<i64>)> = sqlx::query_as(
        "UPDATE outbox SET \
             attempts = attempts + 1, \
             last_error = ?1, \
             updated_at = ?2, \
             poisoned_at = CASE WHEN attempts + 1 >= ?3 THEN ?2 ELSE NULL END, \
             lease_owner = NULL, \
             lease_until = NULL \
         WHERE id = ?4 AND lease_owner = ?5 AND published_at IS NULL \
         RETURNING attempts, poisoned_at",
    )
    .bind(error)
    .bind(now)
    .bind(max_attempts)
    .bind(id)
    .bind(owner)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(|(attempts, poisoned_at)| FailureOutcome {
        attempts,
        poisoned: poisoned_at.is_some(),
    }))
}

/// Quarantine without publishing; returns false if the lease was lost
pub async fn mark_poisoned(
    exec: impl SqliteExecutor<'_>,
    id: &str,
    owner: &str,
    now: i64,
) -> RepoResult<bool> {
    let result = sqlx::query(
        "UPDATE outbox SET poisoned_at = ?1, updated_at = ?1, lease_owner = NULL, lease_until = NULL \
         WHERE id = ?2 AND lease_owner = ?3 AND poisoned_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .bind(owner)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Counts for the unpublished/poisoned gauges
pub async fn backlog(exec: impl SqliteExecutor<'_>) -> RepoResult<OutboxBacklog> {
    let (unpublished, poisoned): (i64, i64) = sqlx::query_as(
        "SELECT \
             COALESCE(SUM(CASE WHEN published_at IS NULL AND poisoned_at IS NULL THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN poisoned_at IS NOT NULL THEN 1 ELSE 0 END), 0) \
         FROM outbox",
    )
    .fetch_one(exec)
    .await?;
    Ok(OutboxBacklog {
        unpublished,
        poisoned,
    })
}

/// Poisoned records awaiting manual remediation, oldest first
pub async fn find_poisoned(exec: impl SqliteExecutor<'_>, limit: i64) -> RepoResult<Vec<OutboxRecord>> {
    let rows = sqlx::query_as::<_, OutboxRow>(&format!(
        "{SELECT_OUTBOX} WHERE poisoned_at IS NOT NULL ORDER BY poisoned_at, id LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}
