use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::sqlite::SqliteCounterStore;
use super::types::{UsageBatchEntry, UsageKey, UsageRow};

/// Flips to `true` when the caller gives up on an in-flight write
pub type AbortSignal = watch::Receiver<bool>;

/// Durable destination for flushed usage counters
pub trait CounterStore: Send + Sync {
    /// Add every row's counters to the stored totals for its (tenant, day).
    ///
    /// All-or-nothing: on error no row of the batch has been applied. Once
    /// `abort` flips to `true` the write must resolve promptly: with an error
    /// if the batch was rolled back, or `Ok` if it had already committed.
    fn upsert_add(
        &self,
        rows: &[UsageRow],
        abort: AbortSignal,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    totals: Mutex<HashMap<UsageKey, UsageBatchEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored totals for one tenant and day
    pub fn usage_for(&self, tenant_id: &str, day: NaiveDate) -> Option<UsageBatchEntry> {
        let key = UsageKey {
            tenant_id: tenant_id.to_string(),
            day,
        };
        self.totals.lock().get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.totals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.lock().is_empty()
    }
}

impl CounterStore for MemoryCounterStore {
    async fn upsert_add(&self, rows: &[UsageRow], _abort: AbortSignal) -> Result<()> {
        let mut totals = self.totals.lock();
        for row in rows {
            totals.entry(row.key()).or_default().merge(&row.entry());
        }
        Ok(())
    }
}

/// Store selected at startup from settings
pub enum CounterBackend {
    Sqlite(SqliteCounterStore),
    Memory(MemoryCounterStore),
}

impl CounterBackend {
    pub fn name(&self) -> &'static str {
        match self {
            CounterBackend::Sqlite(_) => "sqlite",
            CounterBackend::Memory(_) => "memory",
        }
    }
}

impl CounterStore for CounterBackend {
    async fn upsert_add(&self, rows: &[UsageRow], abort: AbortSignal) -> Result<()> {
        match self {
            CounterBackend::Sqlite(store) => store.upsert_add(rows, abort).await,
            CounterBackend::Memory(store) => store.upsert_add(rows, abort).await,
        }
    }
}
