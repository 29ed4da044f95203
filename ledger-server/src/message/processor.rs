//! Message Processor Trait
//!
//! A processor turns one delivered message into a [`ProcessResult`]. The
//! delivery handler owns retries and dead-lettering, so processors stay
//! single-shot.

use async_trait::async_trait;
use shared::error::AppError;
use shared::message::BrokerMessage;

/// Result of message processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// Message processed successfully
    Success { message: String },
    /// Transient failure, deliver again after backoff
    Retry { reason: String },
    /// Permanent failure, dead-letter without retrying
    Failed { reason: String },
    /// Nothing to do (e.g., duplicate delivery)
    Skipped { reason: String },
}

/// Message Processor trait
///
/// `Err` is treated like [`ProcessResult::Retry`]: the handler redelivers
/// until its attempt budget runs out.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    async fn process(&self, msg: &BrokerMessage) -> Result<ProcessResult, AppError>;
}
