//! Projection rebuild
//!
//! A rebuild recomputes `[from, to]` in one transaction: clear the days,
//! load the entries ordered by (day, id), drop their dedup markers, and feed
//! each entry through [`apply_event_in`], the same path live consumption
//! uses. The result therefore matches organic consumption of those entries.
//!
//! Overlapping rebuilds are not excluded. SQLite serializes writers, so two
//! rebuilds of the same range run one after the other and both end with the
//! correct totals; a live event for an in-range day that commits between
//! them is replayed from the entry table anyway.
//!
//! Job statuses live in memory for the life of the process. Only the most
//! recent finished jobs are kept; older ids report `None` like unknown ones.

use chrono::NaiveDate;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use shared::error::{AppResult, ErrorCode};
use shared::models::{DateRange, RebuildStatus};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::apply_event_in;
use crate::db::repository::{RepoError, daily_balance, entry, processed_event};

/// What one rebuild touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub days_cleared: u64,
    pub markers_cleared: u64,
    pub entries_replayed: u64,
}

#[derive(Clone)]
pub struct RebuildService {
    pool: SqlitePool,
}

impl RebuildService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rebuild `[from, to]` synchronously
    pub async fn rebuild_range(&self, from: NaiveDate, to: NaiveDate) -> AppResult<RebuildSummary> {
        let range = DateRange::new(from, to)?;
        let now = shared::util::now_millis();

        let mut tx = self.pool.begin().await.map_err(RepoError::from)?;

        let days_cleared = daily_balance::delete_range(&mut *tx, range.from(), range.to()).await?;
        let entries = entry::find_by_day_range(&mut *tx, range.from(), range.to()).await?;
        let markers_cleared =
            processed_event::delete_for_entries_between(&mut *tx, range.from(), range.to()).await?;

        let mut entries_replayed = 0;
        for e in &entries {
            if apply_event_in(&mut tx, &e.id, e.occurred_on, e.entry_type, e.amount_cents, now).await? {
                entries_replayed += 1;
            }
        }

        tx.commit().await.map_err(RepoError::from)?;

        let summary = RebuildSummary {
            days_cleared,
            markers_cleared,
            entries_replayed,
        };
        tracing::info!(
            from = %range.from(),
            to = %range.to(),
            days_cleared,
            markers_cleared,
            entries_replayed,
            "Projection range rebuilt"
        );
        Ok(summary)
    }
}

/// Finished jobs kept for status polling
pub const RETAINED_FINISHED_JOBS: usize = 256;

/// Background rebuild jobs with polled status
#[derive(Clone)]
pub struct RebuildJobs {
    service: RebuildService,
    jobs: Arc<DashMap<Uuid, RebuildStatus>>,
    /// Finished job ids, oldest first
    finished: Arc<Mutex<VecDeque<Uuid>>>,
    retain: usize,
}

impl RebuildJobs {
    pub fn new(service: RebuildService) -> Self {
        Self::with_retention(service, RETAINED_FINISHED_JOBS)
    }

    /// Keep at most `retain` finished statuses. Pending and running jobs are
    /// never evicted.
    pub fn with_retention(service: RebuildService, retain: usize) -> Self {
        Self {
            service,
            jobs: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
            retain: retain.max(1),
        }
    }

    fn finish(&self, job_id: Uuid, status: RebuildStatus) {
        self.jobs.insert(job_id, status);
        let mut finished = self.finished.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        finished.push_back(job_id);
        while finished.len() > self.retain {
            if let Some(evicted) = finished.pop_front() {
                self.jobs.remove(&evicted);
            }
        }
    }

    /// Validate the range, then run the rebuild in the background.
    ///
    /// Invalid ranges are rejected here and never get a job id.
    pub fn submit(&self, from: NaiveDate, to: NaiveDate) -> AppResult<Uuid> {
        DateRange::new(from, to)?;

        let job_id = Uuid::new_v4();
        self.jobs.insert(job_id, RebuildStatus::Pending);

        let jobs = self.clone();
        tokio::spawn(async move {
            jobs.jobs.insert(job_id, RebuildStatus::Running);
            tracing::info!(%job_id, %from, %to, "Rebuild job started");

            let result = AssertUnwindSafe(jobs.service.rebuild_range(from, to))
                .catch_unwind()
                .await;

            let status = match result {
                Ok(Ok(_)) => RebuildStatus::Succeeded,
                Ok(Err(e)) => {
                    tracing::error!(%job_id, code = %ErrorCode::RebuildFailed, error = %e, "Rebuild job failed");
                    RebuildStatus::Failed { reason: e.message }
                }
                Err(_) => {
                    tracing::error!(%job_id, "Rebuild job panicked");
                    RebuildStatus::Failed {
                        reason: "rebuild task panicked".to_string(),
                    }
                }
            };
            jobs.finish(job_id, status);
        });

        Ok(job_id)
    }

    /// `None` for ids this process never issued
    pub fn status(&self, job_id: &Uuid) -> Option<RebuildStatus> {
        self.jobs.get(job_id).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::outbox;
    use crate::db::test_support::temp_db;
    use crate::ledger::EntryRecorder;
    use crate::observer::NoopObserver;
    use crate::projection::{BalanceProjection, BalanceQueryService};
    use shared::EntryType;
    use shared::models::{BalancePoint, RecordEntry};
    use std::time::Duration;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn cmd(day: &str, cents: i64, entry_type: EntryType, key: &str) -> RecordEntry {
        RecordEntry {
            occurred_on: d(day),
            amount_cents: cents,
            entry_type,
            description: String::new(),
            idempotency_key: key.to_string(),
            request_id: None,
        }
    }

    async fn seed(pool: &SqlitePool) -> Vec<String> {
        let recorder = EntryRecorder::new(pool.clone(), Arc::new(NoopObserver));
        let mut ids = Vec::new();
        for (i, (day, cents, t)) in [
            ("2024-05-01", 1000, EntryType::Credit),
            ("2024-05-01", 300, EntryType::Debit),
            ("2024-05-02", 50, EntryType::Credit),
            ("2024-05-03", 75, EntryType::Debit),
            ("2024-06-01", 10, EntryType::Credit),
        ]
        .into_iter()
        .enumerate()
        {
            let outcome = recorder.record(cmd(day, cents, t, &format!("k-{i}"))).await.unwrap();
            ids.push(outcome.id);
        }
        ids
    }

    async fn consume_all(pool: &SqlitePool, ids: &[String]) {
        let projection = BalanceProjection::new(pool.clone());
        for id in ids.iter().rev() {
            let e = entry::find_by_id(pool, id).await.unwrap().unwrap();
            projection
                .apply_event(&e.id, e.occurred_on, e.entry_type, e.amount_cents)
                .await
                .unwrap();
        }
    }

    async fn snapshot(pool: &SqlitePool) -> Vec<BalancePoint> {
        BalanceQueryService::new(pool.clone())
            .range(d("2024-01-01"), d("2024-12-31"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_matches_organic_consumption() {
        let (db, _dir) = temp_db().await;
        let ids = seed(&db.pool).await;
        consume_all(&db.pool, &ids).await;
        let organic = snapshot(&db.pool).await;

        // Corrupt an in-range day, then rebuild
        daily_balance::upsert_add(&db.pool, d("2024-05-01"), 99_999, 1).await.unwrap();
        let summary = RebuildService::new(db.pool.clone())
            .rebuild_range(d("2024-05-01"), d("2024-05-31"))
            .await
            .unwrap();

        assert_eq!(summary.days_cleared, 3);
        assert_eq!(summary.markers_cleared, 4);
        assert_eq!(summary.entries_replayed, 4);
        assert_eq!(snapshot(&db.pool).await, organic);
        assert_eq!(
            snapshot(&db.pool).await[0],
            BalancePoint {
                day: d("2024-05-01"),
                balance_cents: 700
            }
        );
    }

    #[tokio::test]
    async fn test_rebuild_leaves_out_of_range_untouched() {
        let (db, _dir) = temp_db().await;
        let ids = seed(&db.pool).await;
        consume_all(&db.pool, &ids).await;

        RebuildService::new(db.pool.clone())
            .rebuild_range(d("2024-05-02"), d("2024-05-02"))
            .await
            .unwrap();

        let june = daily_balance::find_by_day(&db.pool, d("2024-06-01")).await.unwrap().unwrap();
        assert_eq!(june.balance_cents, 10);
        // Rebuild never touches the outbox
        assert_eq!(outbox::backlog(&db.pool).await.unwrap().unpublished, 5);
    }

    #[tokio::test]
    async fn test_rebuild_is_repeatable() {
        let (db, _dir) = temp_db().await;
        let ids = seed(&db.pool).await;
        consume_all(&db.pool, &ids).await;
        let service = RebuildService::new(db.pool.clone());

        service.rebuild_range(d("2024-05-01"), d("2024-06-30")).await.unwrap();
        let first = snapshot(&db.pool).await;
        service.rebuild_range(d("2024-05-01"), d("2024-06-30")).await.unwrap();
        assert_eq!(snapshot(&db.pool).await, first);
    }

    #[tokio::test]
    async fn test_rebuild_rejects_bad_ranges() {
        let (db, _dir) = temp_db().await;
        let service = RebuildService::new(db.pool.clone());

        let err = service.rebuild_range(d("2024-05-02"), d("2024-05-01")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDateRange);
        let err = service.rebuild_range(d("2023-01-01"), d("2024-01-02")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeTooLarge);

        let jobs = RebuildJobs::new(service);
        let err = jobs.submit(d("2024-05-02"), d("2024-05-01")).unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_job_status_reaches_succeeded() {
        let (db, _dir) = temp_db().await;
        seed(&db.pool).await;
        let jobs = RebuildJobs::new(RebuildService::new(db.pool.clone()));

        let job_id = jobs.submit(d("2024-05-01"), d("2024-05-31")).unwrap();
        assert!(jobs.status(&job_id).is_some());

        let mut status = None;
        for _ in 0..100 {
            status = jobs.status(&job_id);
            if status.as_ref().is_some_and(RebuildStatus::is_terminal) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, Some(RebuildStatus::Succeeded));
        assert_eq!(jobs.status(&Uuid::new_v4()), None);

        let may = daily_balance::find_by_day(&db.pool, d("2024-05-01")).await.unwrap().unwrap();
        assert_eq!(may.balance_cents, 700);
    }

    async fn wait_terminal(jobs: &RebuildJobs, job_id: &Uuid) -> Option<RebuildStatus> {
        let mut status = None;
        for _ in 0..100 {
            status = jobs.status(job_id);
            if status.as_ref().is_some_and(RebuildStatus::is_terminal) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        status
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_oldest_first() {
        let (db, _dir) = temp_db().await;
        seed(&db.pool).await;
        let jobs = RebuildJobs::with_retention(RebuildService::new(db.pool.clone()), 2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job_id = jobs.submit(d("2024-05-01"), d("2024-05-31")).unwrap();
            assert_eq!(wait_terminal(&jobs, &job_id).await, Some(RebuildStatus::Succeeded));
            ids.push(job_id);
        }

        assert_eq!(jobs.status(&ids[0]), None);
        assert_eq!(jobs.status(&ids[1]), Some(RebuildStatus::Succeeded));
        assert_eq!(jobs.status(&ids[2]), Some(RebuildStatus::Succeeded));
    }
}
