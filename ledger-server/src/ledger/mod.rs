//! Ledger entry recording
//!
//! An entry and its outbox event are written in one transaction. A replayed
//! idempotency key returns the original entry id and writes nothing.

mod recorder;

pub use recorder::EntryRecorder;
