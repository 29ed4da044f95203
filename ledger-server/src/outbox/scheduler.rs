//! Outbox drain scheduler
//!
//! Every tick claims up to `batch_size` records one at a time and publishes
//! them. Claims are leases in the outbox table, so any number of schedulers
//! (tasks or processes) can share one database without coordinating.
//!
//! A worker whose lease was taken over ends its tick. The new owner is
//! already publishing that record, so claiming again would only race it.

use serde::{Deserialize, Serialize};
use shared::error::AppResult;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::EventPublisher;
use crate::db::repository::outbox;
use crate::observer::PipelineObserver;

/// Drain configuration
#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub interval: Duration,
    /// Records attempted per tick
    pub batch_size: u32,
    /// Attempts before a record is poisoned
    pub max_attempts: i64,
    /// Claim lease, longer than the publisher's confirm timeout
    pub lease: Duration,
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 200,
            max_attempts: 20,
            lease: Duration::from_secs(60),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub claimed: u32,
    pub published: u32,
    pub failed: u32,
    pub poisoned: u32,
}

enum Step {
    /// Nothing eligible
    Idle,
    /// Completed elsewhere between claim and read
    Vanished,
    Published,
    Failed { poisoned: bool },
    Poisoned,
    LeaseLost,
}

pub struct OutboxDrainScheduler {
    pool: SqlitePool,
    publisher: Arc<dyn EventPublisher>,
    config: DrainConfig,
    observer: Arc<dyn PipelineObserver>,
    worker_id: String,
    clock: Clock,
}

impl OutboxDrainScheduler {
    pub fn new(
        pool: SqlitePool,
        publisher: Arc<dyn EventPublisher>,
        config: DrainConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            pool,
            publisher,
            config,
            observer,
            worker_id: Uuid::new_v4().to_string(),
            clock: Arc::new(shared::util::now_millis),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one tick, then refresh the backlog gauges
    pub async fn drain_once(&self) -> AppResult<DrainReport> {
        let result = self.drain_batch().await;
        self.report_backlog().await;
        result
    }

    async fn drain_batch(&self) -> AppResult<DrainReport> {
        let mut report = DrainReport::default();

        for _ in 0..self.config.batch_size {
            let step = self.process_one((self.clock)()).await?;
            match step {
                Step::Idle => break,
                Step::Vanished => report.claimed += 1,
                Step::LeaseLost => {
                    report.claimed += 1;
                    break;
                }
                Step::Published => {
                    report.claimed += 1;
                    report.published += 1;
                }
                Step::Failed { poisoned } => {
                    report.claimed += 1;
                    report.failed += 1;
                    if poisoned {
                        report.poisoned += 1;
                    }
                }
                Step::Poisoned => {
                    report.claimed += 1;
                    report.poisoned += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process_one(&self, now: i64) -> AppResult<Step> {
        let lease_until = now.saturating_add(self.config.lease.as_millis() as i64);
        let Some(id) = outbox::claim_next(&self.pool, &self.worker_id, now, lease_until).await? else {
            return Ok(Step::Idle);
        };

        let Some(record) = outbox::find_pending(&self.pool, &id).await? else {
            tracing::debug!(outbox_id = %id, "Claimed record already completed");
            return Ok(Step::Vanished);
        };

        if record.attempts >= self.config.max_attempts {
            if !outbox::mark_poisoned(&self.pool, &id, &self.worker_id, now).await? {
                return Ok(Step::LeaseLost);
            }
            self.observer.outbox_poisoned();
            tracing::warn!(outbox_id = %id, attempts = record.attempts, "Outbox record poisoned");
            return Ok(Step::Poisoned);
        }

        let outcome = self.publisher.publish(&record).await;
        let now = (self.clock)();

        let Some(error) = outcome.error_text() else {
            if outbox::mark_published(&self.pool, &id, &self.worker_id, now).await? {
                return Ok(Step::Published);
            }
            tracing::warn!(outbox_id = %id, "Lease lost before publish was recorded");
            return Ok(Step::LeaseLost);
        };

        let failure = outbox::mark_failed(
            &self.pool,
            &id,
            &self.worker_id,
            &error,
            self.config.max_attempts,
            now,
        )
        .await?;

        match failure {
            Some(failure) if failure.poisoned => {
                self.observer.outbox_poisoned();
                tracing::warn!(outbox_id = %id, attempts = failure.attempts, error = %error, "Outbox record poisoned");
                Ok(Step::Failed { poisoned: true })
            }
            Some(failure) => {
                tracing::info!(
                    outbox_id = %id,
                    attempts = failure.attempts,
                    retry_in_ms = outbox::backoff_ms(failure.attempts),
                    error = %error,
                    "Publish failed, will retry"
                );
                Ok(Step::Failed { poisoned: false })
            }
            None => {
                tracing::warn!(outbox_id = %id, "Lease lost before failure was recorded");
                Ok(Step::LeaseLost)
            }
        }
    }

    async fn report_backlog(&self) {
        match outbox::backlog(&self.pool).await {
            Ok(backlog) => self.observer.outbox_backlog(backlog.unpublished, backlog.poisoned),
            Err(e) => tracing::warn!(error = %e, "Failed to read outbox backlog"),
        }
    }

    /// Drain on a fixed interval until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            worker_id = %self.worker_id,
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox drain scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.drain_once().await {
                    Ok(report) if report.claimed > 0 => {
                        tracing::debug!(
                            claimed = report.claimed,
                            published = report.published,
                            failed = report.failed,
                            poisoned = report.poisoned,
                            "Outbox drained"
                        );
                    }
                    Ok(_) => {}
                    Err(e) if e.code.category().is_operational() => {
                        tracing::error!(code = %e.code, error = %e, "Outbox drain failed");
                    }
                    Err(e) => tracing::warn!(code = %e.code, error = %e, "Outbox drain interrupted"),
                },
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Outbox drain scheduler stopped");
    }
}
