//! Delivery handler for a broker queue
//!
//! Consumes one queue and runs each delivery through a [`MessageProcessor`]:
//! - Bounded concurrency (prefetch) via a semaphore
//! - Redelivery with exponential backoff, capped
//! - Dead-lettering once attempts are exhausted or the message is unprocessable
//!
//! This retry layer is independent of the outbox attempt counter: it bounds
//! how often one delivered message is handed to the processor.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::processor::{MessageProcessor, ProcessResult};
use super::{BrokerError, Delivery, MessageBroker, QueueConsumer};
use crate::observer::PipelineObserver;

/// Delivery retry configuration
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Deliveries processed concurrently
    pub prefetch: usize,
    /// Processing attempts per delivery, first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            prefetch: 8,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl DeliveryConfig {
    /// Wait after the `attempt`-th failure (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// How a delivery left the handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    DeadLettered { reason: String, attempts: u32 },
}

struct DeliveryWorker {
    broker: MessageBroker,
    processor: Arc<dyn MessageProcessor>,
    config: DeliveryConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl DeliveryWorker {
    async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        let name = self.processor.name();
        let mut attempt: u32 = 1;

        loop {
            let reason = match self.processor.process(&delivery.message).await {
                Ok(ProcessResult::Success { message }) => {
                    tracing::debug!(processor = name, delivery_tag = delivery.delivery_tag, result = %message, "Message processed");
                    return DeliveryOutcome::Acked;
                }
                Ok(ProcessResult::Skipped { reason }) => {
                    tracing::debug!(processor = name, delivery_tag = delivery.delivery_tag, reason = %reason, "Message skipped");
                    return DeliveryOutcome::Acked;
                }
                Ok(ProcessResult::Failed { reason }) => {
                    tracing::error!(processor = name, delivery_tag = delivery.delivery_tag, reason = %reason, "Message processing failed permanently");
                    return self.dead_letter(delivery, reason, attempt);
                }
                Ok(ProcessResult::Retry { reason }) => reason,
                Err(e) => e.to_string(),
            };

            if attempt >= self.config.max_attempts {
                tracing::error!(
                    processor = name,
                    delivery_tag = delivery.delivery_tag,
                    attempts = attempt,
                    reason = %reason,
                    "Max delivery attempts exceeded"
                );
                return self.dead_letter(delivery, reason, attempt);
            }

            let delay = self.config.backoff_for(attempt);
            tracing::warn!(
                processor = name,
                delivery_tag = delivery.delivery_tag,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Retrying delivery"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn dead_letter(&self, delivery: Delivery, reason: String, attempts: u32) -> DeliveryOutcome {
        let tag = delivery.delivery_tag;
        let payload_len = delivery.message.payload.len();
        match self.broker.reject(delivery, "rejected") {
            Ok(true) => tracing::error!(delivery_tag = tag, payload_len, reason = %reason, "Delivery sent to dead letter queue"),
            Ok(false) => tracing::error!(delivery_tag = tag, payload_len, reason = %reason, "Delivery rejected but not dead-lettered"),
            Err(e) => tracing::error!(delivery_tag = tag, error = %e, "Failed to reject delivery"),
        }
        self.observer.message_dead_lettered();
        DeliveryOutcome::DeadLettered { reason, attempts }
    }
}

/// Background consumer of one queue
pub struct DeliveryHandler {
    consumer: QueueConsumer,
    worker: Arc<DeliveryWorker>,
    shutdown: CancellationToken,
}

impl DeliveryHandler {
    pub fn new(
        broker: MessageBroker,
        queue: &str,
        processor: Arc<dyn MessageProcessor>,
        config: DeliveryConfig,
        observer: Arc<dyn PipelineObserver>,
        shutdown: CancellationToken,
    ) -> Result<Self, BrokerError> {
        let consumer = broker.consume(queue)?;
        Ok(Self {
            consumer,
            worker: Arc::new(DeliveryWorker {
                broker,
                processor,
                config,
                observer,
            }),
            shutdown,
        })
    }

    /// Process a single delivery with the retry policy, bypassing the queue
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        self.worker.handle(delivery).await
    }

    /// Start consuming
    ///
    /// Long-running; returns after shutdown once in-flight deliveries finish.
    pub async fn run(mut self) {
        let prefetch = self.worker.config.prefetch.max(1);
        let semaphore = Arc::new(Semaphore::new(prefetch));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            queue = %self.consumer.queue(),
            processor = self.worker.processor.name(),
            prefetch,
            "Delivery handler started"
        );

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = self.consumer.recv() => match delivery {
                    Some(d) => d,
                    None => {
                        tracing::info!("Queue closed");
                        break;
                    }
                },
            };

            let worker = self.worker.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                worker.handle(delivery).await;
            });

            // reap finished tasks so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!(queue = %self.consumer.queue(), "Delivery handler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BrokerChannel, QueueOptions};
    use crate::observer::PipelineCounters;
    use async_trait::async_trait;
    use shared::error::AppError;
    use shared::message::{BrokerMessage, HEADER_DEATH_REASON};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `fail_times` times with `result`, then succeeds
    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        permanent: bool,
    }

    #[async_trait]
    impl MessageProcessor for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn process(&self, _msg: &BrokerMessage) -> Result<ProcessResult, AppError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.permanent {
                return Ok(ProcessResult::Failed { reason: "bad payload".into() });
            }
            if n <= self.fail_times {
                return Err(AppError::database("database is locked"));
            }
            Ok(ProcessResult::Success { message: format!("ok after {n}") })
        }
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..DeliveryConfig::default()
        }
    }

    fn broker() -> MessageBroker {
        let broker = MessageBroker::new();
        broker.declare_exchange("ex");
        broker.declare_exchange("dlx");
        broker.declare_queue(
            "q",
            QueueOptions {
                dead_letter_exchange: Some("dlx".into()),
                dead_letter_routing_key: Some("dead".into()),
                max_length: None,
            },
        );
        broker.declare_queue("q.dlq", QueueOptions::default());
        broker.bind("q", "ex", "rk").unwrap();
        broker.bind("q.dlq", "dlx", "dead").unwrap();
        broker
    }

    fn delivery() -> Delivery {
        Delivery {
            delivery_tag: 1,
            queue: "q".into(),
            exchange: "ex".into(),
            routing_key: "rk".into(),
            message: BrokerMessage::json(b"{\"id\":\"x\"}".to_vec()),
        }
    }

    fn handler(broker: &MessageBroker, processor: Arc<Flaky>, counters: Arc<PipelineCounters>) -> DeliveryHandler {
        DeliveryHandler::new(
            broker.clone(),
            "q",
            processor,
            fast_config(),
            counters,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DeliveryConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(5), Duration::from_millis(3200));
        assert_eq!(config.backoff_for(6), Duration::from_secs(5));
        assert_eq!(config.backoff_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let broker = broker();
        let processor = Arc::new(Flaky { calls: AtomicU32::new(0), fail_times: 2, permanent: false });
        let counters = Arc::new(PipelineCounters::new());
        let handler = handler(&broker, processor.clone(), counters.clone());

        assert_eq!(handler.handle_delivery(delivery()).await, DeliveryOutcome::Acked);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.queue_depth("q.dlq"), Some(0));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter_identical_payload() {
        let broker = broker();
        let processor = Arc::new(Flaky { calls: AtomicU32::new(0), fail_times: u32::MAX, permanent: false });
        let counters = Arc::new(PipelineCounters::new());
        let handler = handler(&broker, processor.clone(), counters.clone());

        let outcome = handler.handle_delivery(delivery()).await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 5, .. }));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 5);

        let mut dlq = broker.consume("q.dlq").unwrap();
        let dead = dlq.try_recv().unwrap();
        assert_eq!(dead.message.payload, delivery().message.payload);
        assert_eq!(dead.message.header(HEADER_DEATH_REASON), Some("rejected"));
        assert_eq!(counters.snapshot().messages_dead_lettered_total, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let broker = broker();
        let processor = Arc::new(Flaky { calls: AtomicU32::new(0), fail_times: 0, permanent: true });
        let handler = handler(&broker, processor.clone(), Arc::new(PipelineCounters::new()));

        let outcome = handler.handle_delivery(delivery()).await;
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { attempts: 1, .. }));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_depth("q.dlq"), Some(1));
    }

    #[tokio::test]
    async fn test_run_consumes_until_shutdown() {
        let broker = broker();
        let processor = Arc::new(Flaky { calls: AtomicU32::new(0), fail_times: 0, permanent: false });
        let shutdown = CancellationToken::new();
        let handler = DeliveryHandler::new(
            broker.clone(),
            "q",
            processor.clone(),
            fast_config(),
            Arc::new(PipelineCounters::new()),
            shutdown.clone(),
        )
        .unwrap();
        let task = tokio::spawn(handler.run());

        let (channel, _signals) = broker.open_channel();
        for i in 0..10 {
            let msg = BrokerMessage::json(b"{}".to_vec()).with_correlation_id(format!("m{i}"));
            channel.publish("ex", "rk", msg, true).await.unwrap();
        }

        for _ in 0..200 {
            if processor.calls.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 10);
    }
}
