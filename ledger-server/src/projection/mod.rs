//! Daily balance projection
//!
//! Live consumption and rebuilds both go through [`apply_event_in`], so a
//! rebuilt range is identical to what organic consumption would produce.

mod apply;
mod consumer;
mod query;
mod rebuild;

pub use apply::{BalanceProjection, apply_event_in};
pub use consumer::LedgerEventConsumer;
pub use query::BalanceQueryService;
pub use rebuild::{RebuildJobs, RebuildService, RebuildSummary};
