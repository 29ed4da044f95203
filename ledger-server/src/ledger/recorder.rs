use shared::error::{AppError, AppResult, ErrorCode};
use shared::message::{ENTRY_AGGREGATE, ENTRY_RECORDED_EVENT};
use shared::models::{
    Entry, MAX_DESCRIPTION_LEN, MAX_IDEMPOTENCY_KEY_LEN, OutboxRecord, RecordEntry, RecordOutcome,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::repository::{RepoError, entry, outbox};
use crate::observer::PipelineObserver;

/// Writes entries together with their pending `ledger.entry-recorded` event
#[derive(Clone)]
pub struct EntryRecorder {
    pool: SqlitePool,
    observer: Arc<dyn PipelineObserver>,
}

impl EntryRecorder {
    pub fn new(pool: SqlitePool, observer: Arc<dyn PipelineObserver>) -> Self {
        Self { pool, observer }
    }

    /// Record an entry, idempotent on `idempotency_key`.
    ///
    /// Conflict detection is part of the insert itself, so concurrent
    /// submissions with the same key yield one entry and one outbox record.
    pub async fn record(&self, cmd: RecordEntry) -> AppResult<RecordOutcome> {
        validate(&cmd)?;

        let now = shared::util::now_millis();
        let candidate = Entry {
            id: Uuid::new_v4().to_string(),
            occurred_on: cmd.occurred_on,
            amount_cents: cmd.amount_cents,
            entry_type: cmd.entry_type,
            description: cmd.description,
            idempotency_key: cmd.idempotency_key,
            created_at: now,
        };

        let mut tx = self.pool.begin().await.map_err(RepoError::from)?;

        let stored_id = entry::insert_idempotent(&mut *tx, &candidate).await?;
        let created = stored_id == candidate.id;

        if created {
            let payload = serde_json::to_string(&candidate.to_payload())
                .map_err(|e| AppError::internal(format!("Failed to encode entry payload: {e}")))?;
            let record = OutboxRecord {
                id: candidate.id.clone(),
                aggregate_type: ENTRY_AGGREGATE.to_string(),
                event_type: ENTRY_RECORDED_EVENT.to_string(),
                payload,
                request_id: cmd.request_id,
                created_at: now,
                updated_at: now,
                published_at: None,
                attempts: 0,
                last_error: None,
                poisoned_at: None,
            };
            outbox::insert(&mut *tx, &record).await?;
        }

        tx.commit().await.map_err(RepoError::from)?;

        if created {
            self.observer.entry_created();
            tracing::info!(
                entry_id = %stored_id,
                day = %candidate.occurred_on,
                entry_type = %candidate.entry_type,
                amount_cents = candidate.amount_cents,
                "Entry recorded"
            );
        } else {
            self.observer.entry_replayed();
            tracing::debug!(
                entry_id = %stored_id,
                idempotency_key = %candidate.idempotency_key,
                "Idempotency key replayed, returning existing entry"
            );
        }

        Ok(RecordOutcome {
            id: stored_id,
            created,
        })
    }
}

fn validate(cmd: &RecordEntry) -> AppResult<()> {
    if cmd.amount_cents <= 0 {
        return Err(AppError::invalid_amount(cmd.amount_cents));
    }
    let key = cmd.idempotency_key.trim();
    if key.is_empty() || cmd.idempotency_key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::with_message(
            ErrorCode::InvalidIdempotencyKey,
            format!("Idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"),
        ));
    }
    if cmd.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(AppError::with_message(
            ErrorCode::DescriptionTooLong,
            format!("Description must be at most {MAX_DESCRIPTION_LEN} characters"),
        ));
    }
    Ok(())
}
