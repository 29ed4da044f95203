//! Shared types for the ledger pipeline
//!
//! Wire payloads, the broker message envelope, domain models and the
//! unified error vocabulary used by `ledger-server` and its collaborators.

pub mod error;
pub mod message;
pub mod models;
pub mod util;

// Re-exports
pub use serde::{Deserialize, Serialize};

pub use message::{BrokerMessage, EntryRecordedPayload, EntryType};
