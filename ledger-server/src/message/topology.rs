//! Ledger event topology
//!
//! ```text
//! ledger.events ──ledger.entry-recorded──► report.ledger.entry-recorded.q
//!                                                    │ reject
//!                                                    ▼
//! ledger.dlx ──ledger.entry-recorded.dlq──► report.ledger.entry-recorded.dlq
//! ```

use shared::message::ENTRY_RECORDED_EVENT;

use super::{BrokerError, MessageBroker, QueueOptions};

pub const LEDGER_EXCHANGE: &str = "ledger.events";
pub const ENTRY_RECORDED_ROUTING_KEY: &str = ENTRY_RECORDED_EVENT;
pub const ENTRY_RECORDED_QUEUE: &str = "report.ledger.entry-recorded.q";

pub const DEAD_LETTER_EXCHANGE: &str = "ledger.dlx";
pub const ENTRY_RECORDED_DLQ_ROUTING_KEY: &str = "ledger.entry-recorded.dlq";
pub const ENTRY_RECORDED_DLQ: &str = "report.ledger.entry-recorded.dlq";

/// Dead-letter queue bound; further dead letters are dropped with a warning
pub const DLQ_MAX_LENGTH: usize = 100_000;

/// Declare exchanges, queues and bindings used by the pipeline (idempotent)
pub fn declare_ledger_topology(broker: &MessageBroker) -> Result<(), BrokerError> {
    broker.declare_exchange(LEDGER_EXCHANGE);
    broker.declare_exchange(DEAD_LETTER_EXCHANGE);

    broker.declare_queue(
        ENTRY_RECORDED_QUEUE,
        QueueOptions {
            dead_letter_exchange: Some(DEAD_LETTER_EXCHANGE.to_string()),
            dead_letter_routing_key: Some(ENTRY_RECORDED_DLQ_ROUTING_KEY.to_string()),
            max_length: None,
        },
    );
    broker.declare_queue(
        ENTRY_RECORDED_DLQ,
        QueueOptions {
            max_length: Some(DLQ_MAX_LENGTH),
            ..QueueOptions::default()
        },
    );

    broker.bind(ENTRY_RECORDED_QUEUE, LEDGER_EXCHANGE, ENTRY_RECORDED_ROUTING_KEY)?;
    broker.bind(ENTRY_RECORDED_DLQ, DEAD_LETTER_EXCHANGE, ENTRY_RECORDED_DLQ_ROUTING_KEY)?;

    tracing::info!(
        exchange = LEDGER_EXCHANGE,
        queue = ENTRY_RECORDED_QUEUE,
        dlq = ENTRY_RECORDED_DLQ,
        "Ledger topology declared"
    );
    Ok(())
}
