//! Broker abstraction for ledger events
//!
//! ```text
//!  OutboxPublisher                      DeliveryHandler
//!        │ publish(mandatory)                 ▲ recv / reject
//!        ▼                                    │
//! ┌──────────────┐   route   ┌──────────────────────────────┐
//! │ BrokerChannel│ ────────► │ exchange ──binding──► queue  │
//! └──────┬───────┘           │                  │ reject    │
//!        │ Confirm/Returned  │                  ▼           │
//!        ▼                   │      DLX ──► dead-letter q   │
//!   signal stream            └──────────────────────────────┘
//! ```
//!
//! [`BrokerChannel`] is the publishing seam. Confirms and returns are not
//! results of `publish`; like AMQP they arrive asynchronously on the
//! channel's signal stream, in either order. [`MessageBroker`] is the
//! in-process implementation.

use async_trait::async_trait;
use shared::message::BrokerMessage;
use thiserror::Error;

pub mod broker;
pub mod handler;
pub mod processor;
pub mod topology;

pub use broker::{Delivery, MessageBroker, PublisherChannel, QueueConsumer, QueueOptions};
pub use handler::{DeliveryConfig, DeliveryHandler, DeliveryOutcome};
pub use processor::{MessageProcessor, ProcessResult};

/// Reply code of an unroutable mandatory message
pub const REPLY_NO_ROUTE: u16 = 312;

/// Broker error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue already has a consumer: {0}")]
    AlreadyConsumed(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Out-of-band outcome of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerSignal {
    /// Publisher confirm: the broker took responsibility (`ack`) or refused it
    Confirm {
        correlation_id: String,
        ack: bool,
        cause: Option<String>,
    },
    /// Mandatory message matched no queue
    Returned {
        correlation_id: String,
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
}

impl BrokerSignal {
    pub fn correlation_id(&self) -> &str {
        match self {
            BrokerSignal::Confirm { correlation_id, .. } => correlation_id,
            BrokerSignal::Returned { correlation_id, .. } => correlation_id,
        }
    }
}

/// Publishing side of a broker connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Hand a message to the broker. `Ok` only means it was sent; the
    /// outcome comes later as [`BrokerSignal`]s.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
        mandatory: bool,
    ) -> Result<(), BrokerError>;
}
