//! Outbox draining
//!
//! [`OutboxDrainScheduler`] claims pending outbox records and hands them to
//! an [`EventPublisher`]. [`OutboxPublisher`] is the broker-backed one.

pub mod publisher;
pub mod scheduler;

pub use publisher::{EventPublisher, OutboxPublisher, PublishOutcome, PublisherConfig};
pub use scheduler::{DrainConfig, DrainReport, OutboxDrainScheduler};
