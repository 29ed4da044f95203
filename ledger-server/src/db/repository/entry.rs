//! Entry Repository

use super::{RepoError, RepoResult};
use chrono::NaiveDate;
use shared::models::Entry;
use sqlx::SqliteExecutor;

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: String,
    occurred_on: NaiveDate,
    amount_cents: i64,
    entry_type: String,
    description: String,
    idempotency_key: String,
    created_at: i64,
}

impl TryFrom<EntryRow> for Entry {
    type Error = RepoError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let entry_type = row
            .entry_type
            .parse()
            .map_err(|_| RepoError::Database(format!("Corrupt entry_type for {}", row.id)))?;
        Ok(Entry {
            id: row.id,
            occurred_on: row.occurred_on,
            amount_cents: row.amount_cents,
            entry_type,
            description: row.description,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

const SELECT_ENTRY: &str = "SELECT id, occurred_on, amount_cents, entry_type, description, idempotency_key, created_at FROM entries";

/// Insert `entry` unless its idempotency key exists; returns the stored id.
///
/// The conflict branch rewrites the key to itself so `RETURNING` yields the
/// existing row. The caller compares the returned id with `entry.id` to tell
/// a fresh insert from a replay.
pub async fn insert_idempotent(exec: impl SqliteExecutor<'_>, entry: &Entry) -> RepoResult<String> {
    let id: String = sqlx::query_scalar(
        "INSERT INTO entries (id, occurred_on, amount_cents, entry_type, description, idempotency_key, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(idempotency_key) DO UPDATE SET idempotency_key = excluded.idempotency_key \
         RETURNING id",
    )
    .bind(&entry.id)
    .bind(entry.occurred_on)
    .bind(entry.amount_cents)
    .bind(entry.entry_type.as_str())
    .bind(&entry.description)
    .bind(&entry.idempotency_key)
    .bind(entry.created_at)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

pub async fn find_by_id(exec: impl SqliteExecutor<'_>, id: &str) -> RepoResult<Option<Entry>> {
    let row = sqlx::query_as::<_, EntryRow>(&format!("{SELECT_ENTRY} WHERE id = ?"))
        .bind(id)
        .fetch_optional(exec)
        .await?;
    row.map(Entry::try_from).transpose()
}

/// Entries with `occurred_on` in `[from, to]`, ordered by (day, id)
pub async fn find_by_day_range(
    exec: impl SqliteExecutor<'_>,
    from: NaiveDate,
    to: NaiveDate,
) -> RepoResult<Vec<Entry>> {
    let rows = sqlx::query_as::<_, EntryRow>(&format!(
        "{SELECT_ENTRY} WHERE occurred_on BETWEEN ? AND ? ORDER BY occurred_on, id"
    ))
    .bind(from)
    .bind(to)
    .fetch_all(exec)
    .await?;
    rows.into_iter().map(Entry::try_from).collect()
}

pub async fn count(exec: impl SqliteExecutor<'_>) -> RepoResult<i64> {
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
        .fetch_one(exec)
        .await?;
    Ok(n)
}
