//! In-process message broker
//!
//! Direct exchanges, durable-for-the-process queues, publisher confirms,
//! mandatory returns and dead-letter routing. Each queue is an unbounded
//! mpsc channel with a single consumer; `max_length` turns it into a
//! reject-publish queue (a full queue nacks the publish).

use async_trait::async_trait;
use dashmap::DashMap;
use shared::message::{BrokerMessage, HEADER_DEATH_REASON};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{BrokerChannel, BrokerError, BrokerSignal, REPLY_NO_ROUTE};

/// Header naming the queue a dead-lettered message came from
pub const HEADER_DEATH_QUEUE: &str = "x-first-death-queue";

/// Queue declaration arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Exchange that receives rejected deliveries
    pub dead_letter_exchange: Option<String>,
    /// Routing key for dead-lettered messages, defaults to the original key
    pub dead_letter_routing_key: Option<String>,
    /// Reject publishes once this many messages are waiting
    pub max_length: Option<usize>,
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message: BrokerMessage,
}

#[derive(Debug, Clone)]
struct Binding {
    routing_key: String,
    queue: String,
}

struct Queue {
    options: QueueOptions,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    depth: Arc<AtomicUsize>,
}

impl Queue {
    /// Reserve a slot; false when the queue is at `max_length`
    fn try_reserve(&self) -> bool {
        match self.options.max_length {
            None => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(max) => self
                .depth
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| (d < max).then_some(d + 1))
                .is_ok(),
        }
    }
}

enum RouteOutcome {
    Routed,
    Unroutable,
    Overflow(String),
}

#[derive(Default)]
struct BrokerInner {
    exchanges: DashMap<String, Vec<Binding>>,
    queues: DashMap<String, Arc<Queue>>,
    next_tag: AtomicU64,
}

/// Cheaply cloneable handle to one broker instance
#[derive(Clone, Default)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a direct exchange (no-op if it exists)
    pub fn declare_exchange(&self, name: &str) {
        self.inner.exchanges.entry(name.to_string()).or_default();
    }

    /// Declare a queue (no-op if it exists; options of the first declaration win)
    pub fn declare_queue(&self, name: &str, options: QueueOptions) {
        self.inner.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Queue {
                options,
                tx,
                rx: Mutex::new(Some(rx)),
                depth: Arc::new(AtomicUsize::new(0)),
            })
        });
    }

    /// Bind `queue` to `exchange` for an exact routing key
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        if !self.inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let mut bindings = self
            .inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
        let exists = bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            bindings.push(Binding {
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    /// Open a publisher channel and its confirm/return signal stream
    pub fn open_channel(&self) -> (PublisherChannel, mpsc::UnboundedReceiver<BrokerSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        (
            PublisherChannel {
                broker: self.clone(),
                signals,
            },
            rx,
        )
    }

    /// Attach the single consumer of `queue`
    pub fn consume(&self, queue: &str) -> Result<QueueConsumer, BrokerError> {
        let q = self
            .inner
            .queues
            .get(queue)
            .map(|q| q.value().clone())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let rx = q
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BrokerError::AlreadyConsumed(queue.to_string()))?;
        Ok(QueueConsumer {
            queue: queue.to_string(),
            rx,
            depth: q.depth.clone(),
        })
    }

    /// Messages waiting in `queue`
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.depth.load(Ordering::Acquire))
    }

    /// Reject a delivery without requeue: route it to the queue's
    /// dead-letter exchange with an unchanged payload. Returns false when
    /// the queue has no dead-letter exchange or nothing was bound to it.
    pub fn reject(&self, delivery: Delivery, reason: &str) -> Result<bool, BrokerError> {
        let options = self
            .inner
            .queues
            .get(&delivery.queue)
            .map(|q| q.options.clone())
            .ok_or_else(|| BrokerError::QueueNotFound(delivery.queue.clone()))?;

        let Some(dlx) = options.dead_letter_exchange else {
            tracing::warn!(queue = %delivery.queue, delivery_tag = delivery.delivery_tag, "Rejected delivery dropped: no dead-letter exchange");
            return Ok(false);
        };
        let routing_key = options
            .dead_letter_routing_key
            .unwrap_or_else(|| delivery.routing_key.clone());

        let message = delivery
            .message
            .with_header(HEADER_DEATH_REASON, reason)
            .with_header(HEADER_DEATH_QUEUE, delivery.queue.as_str());

        match self.route(&dlx, &routing_key, message)? {
            RouteOutcome::Routed => Ok(true),
            RouteOutcome::Unroutable => {
                tracing::warn!(exchange = %dlx, routing_key = %routing_key, "Dead-lettered message matched no queue");
                Ok(false)
            }
            RouteOutcome::Overflow(queue) => {
                tracing::warn!(queue = %queue, "Dead-letter queue full, message dropped");
                Ok(false)
            }
        }
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<RouteOutcome, BrokerError> {
        let targets: Vec<String> = self
            .inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?
            .iter()
            .filter(|b| b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            return Ok(RouteOutcome::Unroutable);
        }

        let mut overflow = None;
        for name in targets {
            let Some(queue) = self.inner.queues.get(&name).map(|q| q.value().clone()) else {
                continue;
            };
            if !queue.try_reserve() {
                overflow = Some(name);
                continue;
            }
            let delivery = Delivery {
                delivery_tag: self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
                queue: name.clone(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            };
            if queue.tx.send(delivery).is_err() {
                // consumer dropped its receiver; the message has nowhere to go
                queue.depth.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(queue = %name, "Queue receiver closed, delivery discarded");
            }
        }

        Ok(match overflow {
            Some(queue) => RouteOutcome::Overflow(queue),
            None => RouteOutcome::Routed,
        })
    }
}

/// Publisher side of [`MessageBroker`]
pub struct PublisherChannel {
    broker: MessageBroker,
    signals: mpsc::UnboundedSender<BrokerSignal>,
}

impl PublisherChannel {
    fn signal(&self, signal: BrokerSignal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!("Signal stream closed, confirm dropped");
        }
    }
}

#[async_trait]
impl BrokerChannel for PublisherChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
        mandatory: bool,
    ) -> Result<(), BrokerError> {
        let correlation_id = message.correlation_id.clone().unwrap_or_default();

        match self.broker.route(exchange, routing_key, message)? {
            RouteOutcome::Routed => self.signal(BrokerSignal::Confirm {
                correlation_id,
                ack: true,
                cause: None,
            }),
            RouteOutcome::Unroutable => {
                // AMQP order: basic.return precedes the ack of the same message
                if mandatory {
                    self.signal(BrokerSignal::Returned {
                        correlation_id: correlation_id.clone(),
                        reply_code: REPLY_NO_ROUTE,
                        reply_text: "NO_ROUTE".to_string(),
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                    });
                }
                self.signal(BrokerSignal::Confirm {
                    correlation_id,
                    ack: true,
                    cause: None,
                });
            }
            RouteOutcome::Overflow(queue) => self.signal(BrokerSignal::Confirm {
                correlation_id,
                ack: false,
                cause: Some(format!("queue {queue} is full")),
            }),
        }
        Ok(())
    }
}

/// Receiving side of one queue
pub struct QueueConsumer {
    queue: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    depth: Arc<AtomicUsize>,
}

impl QueueConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next delivery, `None` once the broker is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        let delivery = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(delivery)
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let delivery = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> BrokerMessage {
        BrokerMessage::json(b"{}".to_vec()).with_correlation_id(id)
    }

    fn broker_with_queue(options: QueueOptions) -> MessageBroker {
        let broker = MessageBroker::new();
        broker.declare_exchange("ex");
        broker.declare_queue("q", options);
        broker.bind("q", "ex", "rk").unwrap();
        broker
    }

    #[tokio::test]
    async fn test_routed_publish_is_acked_and_delivered() {
        let broker = broker_with_queue(QueueOptions::default());
        let (channel, mut signals) = broker.open_channel();
        let mut consumer = broker.consume("q").unwrap();

        channel.publish("ex", "rk", msg("m1"), true).await.unwrap();

        assert_eq!(
            signals.recv().await.unwrap(),
            BrokerSignal::Confirm { correlation_id: "m1".into(), ack: true, cause: None }
        );
        assert_eq!(broker.queue_depth("q"), Some(1));
        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.message.correlation_id.as_deref(), Some("m1"));
        assert_eq!(broker.queue_depth("q"), Some(0));
    }

    #[tokio::test]
    async fn test_unroutable_mandatory_returns_before_ack() {
        let broker = broker_with_queue(QueueOptions::default());
        let (channel, mut signals) = broker.open_channel();

        channel.publish("ex", "other", msg("m2"), true).await.unwrap();

        assert!(matches!(
            signals.recv().await.unwrap(),
            BrokerSignal::Returned { reply_code: REPLY_NO_ROUTE, .. }
        ));
        assert!(matches!(
            signals.recv().await.unwrap(),
            BrokerSignal::Confirm { ack: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_full_queue_nacks() {
        let broker = broker_with_queue(QueueOptions {
            max_length: Some(1),
            ..Default::default()
        });
        let (channel, mut signals) = broker.open_channel();

        channel.publish("ex", "rk", msg("a"), true).await.unwrap();
        channel.publish("ex", "rk", msg("b"), true).await.unwrap();

        assert!(matches!(signals.recv().await.unwrap(), BrokerSignal::Confirm { ack: true, .. }));
        assert!(matches!(signals.recv().await.unwrap(), BrokerSignal::Confirm { ack: false, .. }));
        assert_eq!(broker.queue_depth("q"), Some(1));
    }

    #[tokio::test]
    async fn test_missing_exchange_is_an_error() {
        let broker = MessageBroker::new();
        let (channel, _signals) = broker.open_channel();
        let err = channel.publish("nope", "rk", msg("x"), true).await.unwrap_err();
        assert_eq!(err, BrokerError::ExchangeNotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter_queue() {
        let broker = broker_with_queue(QueueOptions {
            dead_letter_exchange: Some("dlx".into()),
            dead_letter_routing_key: Some("rk.dlq".into()),
            max_length: None,
        });
        broker.declare_exchange("dlx");
        broker.declare_queue("q.dlq", QueueOptions::default());
        broker.bind("q.dlq", "dlx", "rk.dlq").unwrap();

        let (channel, _signals) = broker.open_channel();
        let mut consumer = broker.consume("q").unwrap();
        let mut dlq = broker.consume("q.dlq").unwrap();

        channel.publish("ex", "rk", msg("bad"), true).await.unwrap();
        let delivery = consumer.recv().await.unwrap();
        let payload = delivery.message.payload.clone();

        assert!(broker.reject(delivery, "rejected").unwrap());
        let dead = dlq.try_recv().unwrap();
        assert_eq!(dead.message.payload, payload);
        assert_eq!(dead.message.header(HEADER_DEATH_REASON), Some("rejected"));
        assert_eq!(dead.message.header(HEADER_DEATH_QUEUE), Some("q"));
    }

    #[test]
    fn test_single_consumer_per_queue() {
        let broker = broker_with_queue(QueueOptions::default());
        let _first = broker.consume("q").unwrap();
        assert!(matches!(broker.consume("q"), Err(BrokerError::AlreadyConsumed(_))));
        assert!(matches!(broker.consume("missing"), Err(BrokerError::QueueNotFound(_))));
    }
}
