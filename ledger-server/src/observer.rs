//! Pipeline observer
//!
//! Components report what happened through an injected [`PipelineObserver`]
//! instead of writing to a process-wide metrics registry. Every method has a
//! no-op default so an implementation only overrides what it exports.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub trait PipelineObserver: Send + Sync {
    // ==================== Recorder ====================
    fn entry_created(&self) {}
    fn entry_replayed(&self) {}

    // ==================== Publisher / drain ====================
    fn outbox_published(&self) {}
    fn outbox_returned(&self) {}
    fn outbox_nacked(&self) {}
    fn outbox_publish_failed(&self) {}
    fn outbox_poisoned(&self) {}
    fn outbox_backlog(&self, _unpublished: i64, _poisoned: i64) {}

    // ==================== Consumer ====================
    fn event_applied(&self) {}
    fn event_duplicate(&self) {}
    fn message_dead_lettered(&self) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Snapshot of [`PipelineCounters`], keyed by metric name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub entries_created_total: u64,
    pub entries_conflict_total: u64,
    pub outbox_published_total: u64,
    pub outbox_returned_total: u64,
    pub outbox_nacked_total: u64,
    pub outbox_publish_failed_total: u64,
    pub outbox_poisoned_total: u64,
    pub app_entries_processed_total: u64,
    pub app_entries_duplicate_total: u64,
    pub messages_dead_lettered_total: u64,
    pub outbox_unpublished_count: i64,
    pub outbox_poisoned_count: i64,
}

/// Lock-free counters behind [`PipelineObserver`]
#[derive(Debug, Default)]
pub struct PipelineCounters {
    entries_created: AtomicU64,
    entries_conflict: AtomicU64,
    outbox_published: AtomicU64,
    outbox_returned: AtomicU64,
    outbox_nacked: AtomicU64,
    outbox_publish_failed: AtomicU64,
    outbox_poisoned: AtomicU64,
    app_entries_processed: AtomicU64,
    app_entries_duplicate: AtomicU64,
    messages_dead_lettered: AtomicU64,
    unpublished_gauge: AtomicI64,
    poisoned_gauge: AtomicI64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PipelineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            entries_created_total: get(&self.entries_created),
            entries_conflict_total: get(&self.entries_conflict),
            outbox_published_total: get(&self.outbox_published),
            outbox_returned_total: get(&self.outbox_returned),
            outbox_nacked_total: get(&self.outbox_nacked),
            outbox_publish_failed_total: get(&self.outbox_publish_failed),
            outbox_poisoned_total: get(&self.outbox_poisoned),
            app_entries_processed_total: get(&self.app_entries_processed),
            app_entries_duplicate_total: get(&self.app_entries_duplicate),
            messages_dead_lettered_total: get(&self.messages_dead_lettered),
            outbox_unpublished_count: self.unpublished_gauge.load(Ordering::Relaxed),
            outbox_poisoned_count: self.poisoned_gauge.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl PipelineObserver for PipelineCounters {
    fn entry_created(&self) {
        Self::incr(&self.entries_created);
    }

    fn entry_replayed(&self) {
        Self::incr(&self.entries_conflict);
    }

    fn outbox_published(&self) {
        Self::incr(&self.outbox_published);
    }

    fn outbox_returned(&self) {
        Self::incr(&self.outbox_returned);
    }

    fn outbox_nacked(&self) {
        Self::incr(&self.outbox_nacked);
    }

    fn outbox_publish_failed(&self) {
        Self::incr(&self.outbox_publish_failed);
    }

    fn outbox_poisoned(&self) {
        Self::incr(&self.outbox_poisoned);
    }

    fn outbox_backlog(&self, unpublished: i64, poisoned: i64) {
        self.unpublished_gauge.store(unpublished, Ordering::Relaxed);
        self.poisoned_gauge.store(poisoned, Ordering::Relaxed);
    }

    fn event_applied(&self) {
        Self::incr(&self.app_entries_processed);
    }

    fn event_duplicate(&self) {
        Self::incr(&self.app_entries_duplicate);
    }

    fn message_dead_lettered(&self) {
        Self::incr(&self.messages_dead_lettered);
    }
}
