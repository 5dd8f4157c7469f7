//! Usage aggregation: per-tenant daily counters with write-behind flushing.
//!
//! Events are counted in memory under a (tenant, UTC day) key and written to
//! a [`CounterStore`] in batches. Stores add to existing totals, so a batch
//! that is re-queued after a failure is never counted twice.

mod aggregator;
pub mod sqlite;
pub mod store;
pub mod types;

pub use aggregator::UsageAggregator;
pub use sqlite::SqliteCounterStore;
pub use store::{AbortSignal, CounterBackend, CounterStore, MemoryCounterStore};
pub use types::{
    FlushOutcome, TokenUsage, UsageBatchEntry, UsageEvent, UsageKey, UsageRow, UsageStatus,
};
