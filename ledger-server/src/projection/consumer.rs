use async_trait::async_trait;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::message::{BrokerMessage, EntryRecordedPayload, HEADER_IDEMPOTENCY_KEY};
use std::sync::Arc;

use super::BalanceProjection;
use crate::message::{MessageProcessor, ProcessResult};
use crate::observer::PipelineObserver;

/// Applies `ledger.entry-recorded` events to the daily balance projection
#[derive(Clone)]
pub struct LedgerEventConsumer {
    projection: BalanceProjection,
    observer: Arc<dyn PipelineObserver>,
}

impl LedgerEventConsumer {
    pub fn new(projection: BalanceProjection, observer: Arc<dyn PipelineObserver>) -> Self {
        Self {
            projection,
            observer,
        }
    }

    /// Parse and apply one raw payload. Returns whether it changed the
    /// projection (false for a duplicate delivery).
    ///
    /// Unparseable payloads and non-positive amounts fail with
    /// [`ErrorCode::MalformedMessage`] / [`ErrorCode::InvalidAmount`];
    /// anything else is a storage error worth redelivering.
    pub async fn handle(&self, raw: &[u8]) -> AppResult<bool> {
        let event: EntryRecordedPayload = serde_json::from_slice(raw)
            .map_err(|e| AppError::malformed(format!("Invalid entry-recorded payload: {e}")))?;

        let applied = self
            .projection
            .apply_event(&event.id, event.occurred_on, event.entry_type, event.amount_cents)
            .await?;

        if applied {
            self.observer.event_applied();
            tracing::debug!(event_id = %event.id, day = %event.occurred_on, "Event applied to projection");
        } else {
            self.observer.event_duplicate();
            tracing::info!(event_id = %event.id, "Duplicate delivery ignored");
        }
        Ok(applied)
    }
}

#[async_trait]
impl MessageProcessor for LedgerEventConsumer {
    fn name(&self) -> &'static str {
        "ledger_event_consumer"
    }

    async fn process(&self, msg: &BrokerMessage) -> Result<ProcessResult, AppError> {
        match self.handle(&msg.payload).await {
            Ok(true) => Ok(ProcessResult::Success {
                message: "applied".to_string(),
            }),
            Ok(false) => Ok(ProcessResult::Skipped {
                reason: format!(
                    "duplicate event {}",
                    msg.header(HEADER_IDEMPOTENCY_KEY).unwrap_or("?")
                ),
            }),
            Err(e) if matches!(e.code, ErrorCode::MalformedMessage | ErrorCode::InvalidAmount) => {
                Ok(ProcessResult::Failed { reason: e.message })
            }
            Err(e) => Err(e),
        }
    }
}
