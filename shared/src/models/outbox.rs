//! Outbox Model

use serde::{Deserialize, Serialize};

/// Lifecycle state derived from the record's terminal timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    Pending,
    Published,
    Poisoned,
}

/// Event waiting for (or done with) publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Equals the id of the entry that produced it
    pub id: String,
    pub aggregate_type: String,
    pub event_type: String,
    /// JSON payload as sent on the wire
    pub payload: String,
    pub request_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Set once on confirmed publication (terminal)
    pub published_at: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Set once when attempts are exhausted (terminal)
    pub poisoned_at: Option<i64>,
}

impl OutboxRecord {
    pub fn state(&self) -> OutboxState {
        if self.published_at.is_some() {
            OutboxState::Published
        } else if self.poisoned_at.is_some() {
            OutboxState::Poisoned
        } else {
            OutboxState::Pending
        }
    }
}

/// Unpublished/poisoned counts for the outbox gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxBacklog {
    pub unpublished: i64,
    pub poisoned: i64,
}
