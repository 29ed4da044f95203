//! End-to-end pipeline: record → outbox → broker → consumer → projection

use chrono::NaiveDate;
use ledger_server::db::DbService;
use ledger_server::message::topology::{
    ENTRY_RECORDED_DLQ, ENTRY_RECORDED_QUEUE, ENTRY_RECORDED_ROUTING_KEY, LEDGER_EXCHANGE,
    declare_ledger_topology,
};
use ledger_server::message::{DeliveryConfig, DeliveryHandler, DeliveryOutcome, MessageBroker};
use ledger_server::outbox::{DrainConfig, PublisherConfig};
use ledger_server::projection::BalanceProjection;
use ledger_server::{
    BalanceQueryService, BrokerChannel, EntryRecorder, LedgerEventConsumer, OutboxDrainScheduler,
    OutboxPublisher, PipelineCounters, RebuildService,
};
use shared::EntryType;
use shared::message::{BrokerMessage, HEADER_DEATH_REASON};
use shared::models::{OutboxState, RecordEntry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    db: DbService,
    broker: MessageBroker,
    counters: Arc<PipelineCounters>,
    recorder: EntryRecorder,
    scheduler: OutboxDrainScheduler,
    consumer: LedgerEventConsumer,
    queries: BalanceQueryService,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// `bind_topology = false` leaves the exchange without queues
    async fn new(bind_topology: bool, max_attempts: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let db = DbService::new(path.to_str().unwrap()).await.unwrap();

        let broker = MessageBroker::new();
        if bind_topology {
            declare_ledger_topology(&broker).unwrap();
        } else {
            broker.declare_exchange(LEDGER_EXCHANGE);
        }

        let counters = Arc::new(PipelineCounters::new());
        let (channel, signals) = broker.open_channel();
        let publisher = Arc::new(OutboxPublisher::new(
            Arc::new(channel),
            PublisherConfig {
                confirm_timeout: Duration::from_secs(2),
                ..PublisherConfig::default()
            },
            counters.clone(),
        ));

        let shutdown = CancellationToken::new();
        {
            let publisher = publisher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { publisher.run_signal_listener(signals, shutdown).await });
        }

        let scheduler = OutboxDrainScheduler::new(
            db.pool.clone(),
            publisher,
            DrainConfig {
                max_attempts,
                ..DrainConfig::default()
            },
            counters.clone(),
        );

        Self {
            recorder: EntryRecorder::new(db.pool.clone(), counters.clone()),
            consumer: LedgerEventConsumer::new(BalanceProjection::new(db.pool.clone()), counters.clone()),
            queries: BalanceQueryService::new(db.pool.clone()),
            db,
            broker,
            counters,
            scheduler,
            shutdown,
            _dir: dir,
        }
    }

    async fn record(&self, day: &str, cents: i64, entry_type: EntryType, key: &str) -> String {
        self.recorder
            .record(RecordEntry {
                occurred_on: d(day),
                amount_cents: cents,
                entry_type,
                description: format!("entry {key}"),
                idempotency_key: key.to_string(),
                request_id: Some(format!("req-{key}")),
            })
            .await
            .unwrap()
            .id
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_recorded_entries_reach_the_projection() {
    let h = Harness::new(true, 20).await;
    h.record("2024-03-10", 10_000, EntryType::Credit, "a").await;
    h.record("2024-03-10", 2_500, EntryType::Debit, "b").await;
    h.record("2024-03-11", 700, EntryType::Credit, "c").await;
    // replayed key: no new entry, no new event
    h.record("2024-03-10", 10_000, EntryType::Credit, "a").await;

    let report = h.scheduler.drain_once().await.unwrap();
    assert_eq!(report.published, 3);
    assert_eq!(h.broker.queue_depth(ENTRY_RECORDED_QUEUE), Some(3));

    let mut queue = h.broker.consume(ENTRY_RECORDED_QUEUE).unwrap();
    let mut deliveries = Vec::new();
    while let Some(delivery) = queue.try_recv() {
        deliveries.push(delivery);
    }
    assert_eq!(deliveries.len(), 3);
    assert!(
        deliveries
            .iter()
            .any(|d| d.message.header("X-Request-Id") == Some("req-a"))
    );

    // at-least-once: every message arrives twice
    for delivery in deliveries.iter().chain(deliveries.iter()) {
        h.consumer.handle(&delivery.message.payload).await.unwrap();
    }

    assert_eq!(h.queries.daily(d("2024-03-10")).await.unwrap().balance_cents, 7_500);
    assert_eq!(h.queries.daily(d("2024-03-11")).await.unwrap().balance_cents, 700);
    assert_eq!(h.queries.daily(d("2024-03-12")).await.unwrap().balance_cents, 0);

    let stats = h.counters.snapshot();
    assert_eq!(stats.entries_created_total, 3);
    assert_eq!(stats.entries_conflict_total, 1);
    assert_eq!(stats.outbox_published_total, 3);
    assert_eq!(stats.app_entries_processed_total, 3);
    assert_eq!(stats.app_entries_duplicate_total, 3);
    assert_eq!(stats.outbox_unpublished_count, 0);

    // rebuild reproduces what consumption produced
    let before = h.queries.range(d("2024-03-01"), d("2024-03-31")).await.unwrap();
    RebuildService::new(h.db.pool.clone())
        .rebuild_range(d("2024-03-01"), d("2024-03-31"))
        .await
        .unwrap();
    assert_eq!(h.queries.range(d("2024-03-01"), d("2024-03-31")).await.unwrap(), before);
}

#[tokio::test]
async fn test_unroutable_event_is_poisoned() {
    let h = Harness::new(false, 1).await;
    let id = h.record("2024-03-10", 100, EntryType::Credit, "lost").await;

    let report = h.scheduler.drain_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.poisoned, 1);

    let record = ledger_server::db::repository::outbox::find_by_id(&h.db.pool, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state(), OutboxState::Poisoned);
    assert!(record.last_error.unwrap().contains("returned"));

    let stats = h.counters.snapshot();
    assert_eq!(stats.outbox_returned_total, 1);
    assert_eq!(stats.outbox_poisoned_count, 1);
    // poisoned records stay out of later ticks
    assert_eq!(h.scheduler.drain_once().await.unwrap().claimed, 0);
}

#[tokio::test]
async fn test_malformed_message_goes_to_dead_letter_queue() {
    let h = Harness::new(true, 20).await;
    let handler = DeliveryHandler::new(
        h.broker.clone(),
        ENTRY_RECORDED_QUEUE,
        Arc::new(h.consumer.clone()),
        DeliveryConfig {
            initial_backoff: Duration::from_millis(1),
            ..DeliveryConfig::default()
        },
        h.counters.clone(),
        h.shutdown.clone(),
    )
    .unwrap();
    let worker = tokio::spawn(handler.run());

    let (channel, _signals) = h.broker.open_channel();
    channel
        .publish(
            LEDGER_EXCHANGE,
            ENTRY_RECORDED_ROUTING_KEY,
            BrokerMessage::json(b"{\"id\":42}".to_vec()).with_correlation_id("bad"),
            true,
        )
        .await
        .unwrap();

    let mut dlq = h.broker.consume(ENTRY_RECORDED_DLQ).unwrap();
    let dead = tokio::time::timeout(Duration::from_secs(5), dlq.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.message.payload, b"{\"id\":42}".to_vec());
    assert!(dead.message.header(HEADER_DEATH_REASON).is_some());
    assert_eq!(h.counters.snapshot().messages_dead_lettered_total, 1);

    h.shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_handle_delivery_reports_outcome() {
    let h = Harness::new(true, 20).await;
    h.record("2024-04-01", 900, EntryType::Debit, "x").await;
    h.scheduler.drain_once().await.unwrap();

    let mut queue = h.broker.consume(ENTRY_RECORDED_QUEUE).unwrap();
    let delivery = queue.try_recv().unwrap();

    // the live queue is consumed above; the handler gets a broker of its own
    let processor = Arc::new(h.consumer.clone());
    let broker = MessageBroker::new();
    declare_ledger_topology(&broker).unwrap();
    let handler = DeliveryHandler::new(
        broker,
        ENTRY_RECORDED_QUEUE,
        processor,
        DeliveryConfig::default(),
        h.counters.clone(),
        h.shutdown.clone(),
    )
    .unwrap();

    assert_eq!(handler.handle_delivery(delivery.clone()).await, DeliveryOutcome::Acked);
    assert_eq!(handler.handle_delivery(delivery).await, DeliveryOutcome::Acked);
    assert_eq!(h.queries.daily(d("2024-04-01")).await.unwrap().balance_cents, -900);
}
