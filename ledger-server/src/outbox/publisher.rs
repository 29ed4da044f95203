//! Broker publisher with confirm/return reconciliation
//!
//! A confirm and a return for the same message arrive independently on the
//! channel's signal stream. Each publish registers an [`Attempt`] under its
//! correlation id (the outbox id). A return flags the attempt, the confirm
//! resolves it, and the attempt only counts as published when it was acked
//! and never returned.
//!
//! AMQP delivers `basic.return` before the `basic.ack` of the same message,
//! so a return is always seen before its attempt resolves. A return that
//! arrives after resolution finds no attempt and is dropped.
//!
//! Attempts carry a sequence number. If two attempts for one id overlap, the
//! newer replaces the older (whose wait fails), and each attempt only ever
//! clears its own entry.

use async_trait::async_trait;
use dashmap::DashMap;
use shared::message::{
    BrokerMessage, EVENT_VERSION, HEADER_EVENT_VERSION, HEADER_IDEMPOTENCY_KEY, HEADER_REQUEST_ID,
};
use shared::models::OutboxRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::message::topology::{ENTRY_RECORDED_ROUTING_KEY, LEDGER_EXCHANGE};
use crate::message::{BrokerChannel, BrokerSignal};
use crate::observer::PipelineObserver;

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub routing_key: String,
    /// Upper bound on the wait for a publisher confirm
    pub confirm_timeout: Duration,
    /// Ask the broker to return unroutable messages
    pub mandatory: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: LEDGER_EXCHANGE.to_string(),
            routing_key: ENTRY_RECORDED_ROUTING_KEY.to_string(),
            confirm_timeout: Duration::from_secs(10),
            mandatory: true,
        }
    }
}

/// Outcome of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Acked and routed
    Confirmed,
    /// Acked, but the broker returned it as unroutable
    Returned { reply_code: u16, reply_text: String },
    Nacked { cause: Option<String> },
    /// Send failed before the broker saw it
    SendFailed { error: String },
    TimedOut,
}

impl PublishOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PublishOutcome::Confirmed)
    }

    /// Text stored as the outbox record's `last_error`
    pub fn error_text(&self) -> Option<String> {
        match self {
            PublishOutcome::Confirmed => None,
            PublishOutcome::Returned { reply_code, reply_text } => {
                Some(format!("returned by broker: {reply_code} {reply_text}"))
            }
            PublishOutcome::Nacked { cause } => Some(match cause {
                Some(c) => format!("nacked by broker: {c}"),
                None => "nacked by broker".to_string(),
            }),
            PublishOutcome::SendFailed { error } => Some(format!("send failed: {error}")),
            PublishOutcome::TimedOut => Some("confirm timed out".to_string()),
        }
    }
}

/// Publishes one outbox record, a single attempt without internal retry
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> PublishOutcome;

    /// `true` only when the broker acked the message and did not return it
    async fn publish_and_confirm(&self, record: &OutboxRecord) -> bool {
        self.publish(record).await.is_confirmed()
    }
}

struct Confirmation {
    ack: bool,
    cause: Option<String>,
    /// Return seen before the confirm
    returned: Option<(u16, String)>,
}

/// In-flight publish state for one correlation id
struct Attempt {
    seq: u64,
    returned: Option<(u16, String)>,
    confirm_tx: Option<oneshot::Sender<Confirmation>>,
}

pub struct OutboxPublisher {
    channel: Arc<dyn BrokerChannel>,
    in_flight: DashMap<String, Attempt>,
    next_seq: AtomicU64,
    config: PublisherConfig,
    observer: Arc<dyn PipelineObserver>,
}

impl OutboxPublisher {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        config: PublisherConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            channel,
            in_flight: DashMap::new(),
            next_seq: AtomicU64::new(0),
            config,
            observer,
        }
    }

    /// Feed one broker signal into the in-flight attempts.
    ///
    /// Signals for correlation ids that are not in flight are dropped.
    pub fn handle_signal(&self, signal: BrokerSignal) {
        match signal {
            BrokerSignal::Returned {
                correlation_id,
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => match self.in_flight.get_mut(&correlation_id) {
                Some(mut attempt) => {
                    tracing::warn!(
                        outbox_id = %correlation_id,
                        reply_code,
                        reply_text = %reply_text,
                        exchange = %exchange,
                        routing_key = %routing_key,
                        "Message returned by broker"
                    );
                    attempt.returned = Some((reply_code, reply_text));
                }
                None => {
                    tracing::debug!(outbox_id = %correlation_id, "Return for unknown correlation id dropped");
                }
            },
            BrokerSignal::Confirm {
                correlation_id,
                ack,
                cause,
            } => {
                let pending = self.in_flight.get_mut(&correlation_id).and_then(|mut attempt| {
                    let returned = attempt.returned.clone();
                    attempt.confirm_tx.take().map(|tx| (tx, returned))
                });
                match pending {
                    Some((tx, returned)) => {
                        // receiver is gone when the publish already timed out
                        let _ = tx.send(Confirmation { ack, cause, returned });
                    }
                    None => {
                        tracing::debug!(outbox_id = %correlation_id, ack, "Confirm for unknown correlation id dropped");
                    }
                }
            }
        }
    }

    /// Drain the channel's signal stream until shutdown or until it closes
    pub async fn run_signal_listener(
        &self,
        mut signals: mpsc::UnboundedReceiver<BrokerSignal>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Publisher signal listener started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        tracing::trace!(correlation_id = %signal.correlation_id(), "Broker signal received");
                        self.handle_signal(signal);
                    }
                    None => {
                        tracing::warn!("Broker signal stream closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("Publisher signal listener stopped");
    }

    /// Number of attempts waiting for a confirm
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn build_message(&self, record: &OutboxRecord) -> BrokerMessage {
        let mut message = BrokerMessage::json(record.payload.as_bytes().to_vec())
            .with_correlation_id(record.id.as_str())
            .with_header(HEADER_IDEMPOTENCY_KEY, record.id.as_str())
            .with_header(HEADER_EVENT_VERSION, EVENT_VERSION.to_string());
        if let Some(request_id) = &record.request_id {
            message = message.with_header(HEADER_REQUEST_ID, request_id.as_str());
        }
        message
    }

    async fn send_and_wait(&self, record: &OutboxRecord, seq: u64) -> PublishOutcome {
        let (confirm_tx, confirm_rx) = oneshot::channel();
        // replaces any marker a previous attempt of this record left behind
        self.in_flight.insert(
            record.id.clone(),
            Attempt {
                seq,
                returned: None,
                confirm_tx: Some(confirm_tx),
            },
        );

        let message = self.build_message(record);
        if let Err(e) = self
            .channel
            .publish(&self.config.exchange, &self.config.routing_key, message, self.config.mandatory)
            .await
        {
            return PublishOutcome::SendFailed {
                error: e.to_string(),
            };
        }

        let confirmation = match tokio::time::timeout(self.config.confirm_timeout, confirm_rx).await {
            Ok(Ok(confirmation)) => confirmation,
            Ok(Err(_)) => {
                return PublishOutcome::SendFailed {
                    error: "superseded by a newer attempt".to_string(),
                };
            }
            Err(_) => return PublishOutcome::TimedOut,
        };

        if !confirmation.ack {
            return PublishOutcome::Nacked {
                cause: confirmation.cause,
            };
        }

        let returned = confirmation.returned.or_else(|| {
            self.in_flight
                .get(&record.id)
                .filter(|attempt| attempt.seq == seq)
                .and_then(|attempt| attempt.returned.clone())
        });
        match returned {
            Some((reply_code, reply_text)) => PublishOutcome::Returned {
                reply_code,
                reply_text,
            },
            None => PublishOutcome::Confirmed,
        }
    }
}

#[async_trait]
impl EventPublisher for OutboxPublisher {
    async fn publish(&self, record: &OutboxRecord) -> PublishOutcome {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let outcome = self.send_and_wait(record, seq).await;
        self.in_flight.remove_if(&record.id, |_, attempt| attempt.seq == seq);

        match &outcome {
            PublishOutcome::Confirmed => {
                self.observer.outbox_published();
                tracing::debug!(outbox_id = %record.id, "Publish confirmed");
            }
            PublishOutcome::Returned { .. } => self.observer.outbox_returned(),
            PublishOutcome::Nacked { cause } => {
                self.observer.outbox_nacked();
                tracing::warn!(outbox_id = %record.id, cause = ?cause, "Publish nacked");
            }
            PublishOutcome::SendFailed { error } => {
                self.observer.outbox_publish_failed();
                tracing::warn!(outbox_id = %record.id, error = %error, "Publish failed");
            }
            PublishOutcome::TimedOut => {
                self.observer.outbox_publish_failed();
                tracing::warn!(
                    outbox_id = %record.id,
                    timeout_ms = self.config.confirm_timeout.as_millis() as u64,
                    "Publish confirm timed out"
                );
            }
        }
        outcome
    }
}
