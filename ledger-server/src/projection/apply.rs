use chrono::NaiveDate;
use shared::EntryType;
use shared::error::AppResult;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::repository::{RepoError, daily_balance, processed_event};

/// Apply one event inside the caller's transaction.
///
/// Inserts the dedup marker first; only a fresh marker adds the signed
/// amount to the day. Returns whether the event changed the projection.
pub async fn apply_event_in(
    conn: &mut SqliteConnection,
    event_id: &str,
    day: NaiveDate,
    entry_type: EntryType,
    amount_cents: i64,
    now: i64,
) -> AppResult<bool> {
    let delta = entry_type.signed_amount(amount_cents)?;

    if !processed_event::insert_if_absent(&mut *conn, event_id, now).await? {
        return Ok(false);
    }
    daily_balance::upsert_add(&mut *conn, day, delta, now).await?;
    Ok(true)
}

/// Write side of the projection
#[derive(Clone)]
pub struct BalanceProjection {
    pool: SqlitePool,
}

impl BalanceProjection {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply one event in its own transaction; marker and balance commit
    /// or roll back together.
    pub async fn apply_event(
        &self,
        event_id: &str,
        day: NaiveDate,
        entry_type: EntryType,
        amount_cents: i64,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await.map_err(RepoError::from)?;
        let applied = apply_event_in(
            &mut tx,
            event_id,
            day,
            entry_type,
            amount_cents,
            shared::util::now_millis(),
        )
        .await?;
        tx.commit().await.map_err(RepoError::from)?;
        Ok(applied)
    }
}
