//! Data models
//!
//! Storage rows are mapped into these types by the server's repositories.
//! Days are `NaiveDate`, timestamps are epoch milliseconds.

pub mod balance;
pub mod entry;
pub mod outbox;
pub mod rebuild;

// Re-exports
pub use balance::*;
pub use entry::*;
pub use outbox::*;
pub use rebuild::*;
