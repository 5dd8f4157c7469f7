//! UsageAggregator: write-behind cache of per-tenant daily counters.
//!
//! `track` only touches memory. A background task drains the pending map to
//! the counter store on a timer or when the map reaches `max_batch_size`
//! entries; `shutdown` stops that task and performs one last flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::CounterStore;
use super::types::{
    FlushOutcome, TokenUsage, UsageBatchEntry, UsageEvent, UsageKey, UsageRow, UsageStatus,
};
use crate::clock::{Clock, SharedClock};
use crate::config::UsageSettings;

#[derive(Debug, Default)]
struct FlushStats {
    consecutive_failures: u32,
    last_flush: Option<FlushOutcome>,
    last_flush_at: Option<DateTime<Utc>>,
}

/// Aggregates usage events in memory and flushes them to a [`CounterStore`]
pub struct UsageAggregator<S> {
    settings: UsageSettings,
    clock: SharedClock,
    store: Arc<S>,
    pending: Mutex<HashMap<UsageKey, UsageBatchEntry>>,
    shutting_down: AtomicBool,
    /// Serializes flushes so two batches never race to the store
    flush_lock: tokio::sync::Mutex<()>,
    batch_full: Notify,
    stats: Mutex<FlushStats>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: Option<broadcast::Sender<FlushOutcome>>,
}

impl<S: CounterStore + 'static> UsageAggregator<S> {
    pub fn new(settings: UsageSettings, clock: SharedClock, store: Arc<S>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            settings,
            clock,
            store,
            pending: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            batch_full: Notify::new(),
            stats: Mutex::new(FlushStats::default()),
            cancel,
            task: Mutex::new(None),
            events: None,
        }
    }

    /// Publish every non-empty flush outcome on the given channel
    pub fn with_events(mut self, tx: broadcast::Sender<FlushOutcome>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &UsageSettings {
        &self.settings
    }

    /// Count one event for `tenant` under today's UTC date.
    ///
    /// Returns false (and records nothing) once shutdown has begun. The flag
    /// is read under the pending lock, which `shutdown` also holds while
    /// setting it, so an accepted event is always seen by the final flush.
    pub fn track(&self, tenant: &str, event: UsageEvent, tokens: Option<TokenUsage>) -> bool {
        let key = UsageKey {
            tenant_id: tenant.to_string(),
            day: self.clock.today(),
        };
        let max = self.settings.max_batch_size;

        let crossed_limit = {
            let mut pending = self.pending.lock();
            if self.shutting_down.load(Ordering::Acquire) {
                drop(pending);
                debug!(tenant = %tenant, ?event, "Dropping usage event after shutdown");
                return false;
            }
            let before = pending.len();
            pending.entry(key).or_default().record(event, tokens);
            before < max && pending.len() >= max
        };

        // Wake once per crossing; a re-queued batch waits for the timer
        if crossed_limit && self.consecutive_failures() == 0 {
            self.batch_full.notify_one();
        }
        true
    }

    /// Distinct (tenant, day) entries awaiting a flush
    pub fn pending_entries(&self) -> usize {
        self.pending.lock().len()
    }

    /// Pending counters for one key (not yet flushed)
    pub fn pending_for(&self, key: &UsageKey) -> Option<UsageBatchEntry> {
        self.pending.lock().get(key).copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Drain the pending map into the store.
    ///
    /// The map is swapped out before the store call so events tracked while
    /// the write is in flight land in a fresh map. On timeout the write is
    /// aborted and awaited, so the batch counts as flushed only if it
    /// committed. A batch that did not commit is added back into whatever has
    /// accumulated since.
    pub async fn flush(&self) -> FlushOutcome {
        let _serial = self.flush_lock.lock().await;

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut rows: Vec<UsageRow> = batch
            .iter()
            .map(|(key, entry)| UsageRow::new(key, entry))
            .collect();
        rows.sort_by(|a, b| (&a.tenant_id, a.day).cmp(&(&b.tenant_id, b.day)));

        let batch_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let timeout = self.settings.flush_timeout();

        let (abort_tx, abort_rx) = watch::channel(false);
        let write = self.store.upsert_add(&rows, abort_rx);
        tokio::pin!(write);

        let result = match tokio::time::timeout(timeout, &mut write).await {
            Ok(result) => result,
            Err(_) => {
                // The store reports whether the batch committed before the abort
                abort_tx.send_replace(true);
                match write.await {
                    Ok(()) => {
                        warn!(
                            batch_id = %batch_id,
                            timeout_ms = self.settings.flush_timeout_ms,
                            "Usage batch committed after the flush timeout"
                        );
                        Ok(())
                    }
                    Err(e) => Err(anyhow::anyhow!(
                        "store write exceeded {}ms: {:#}",
                        self.settings.flush_timeout_ms,
                        e
                    )),
                }
            }
        };

        let outcome = match result {
            Ok(()) => {
                let duration_ms =
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                info!(
                    batch_id = %batch_id,
                    rows = rows.len(),
                    duration_ms,
                    "Flushed usage batch"
                );
                FlushOutcome::Flushed {
                    batch_id,
                    rows: rows.len(),
                    duration_ms,
                }
            }
            Err(e) => {
                self.requeue(batch);
                warn!(
                    batch_id = %batch_id,
                    rows = rows.len(),
                    error = %format!("{:#}", e),
                    "Usage flush failed, batch re-queued"
                );
                FlushOutcome::Failed {
                    batch_id,
                    rows: rows.len(),
                    error: format!("{:#}", e),
                }
            }
        };

        {
            let mut stats = self.stats.lock();
            if outcome.is_failure() {
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
            } else {
                stats.consecutive_failures = 0;
            }
            stats.last_flush = Some(outcome.clone());
            stats.last_flush_at = Some(self.clock.utc_now());
        }

        if let Some(tx) = &self.events {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    fn requeue(&self, batch: HashMap<UsageKey, UsageBatchEntry>) {
        let mut pending = self.pending.lock();
        for (key, entry) in batch {
            pending.entry(key).or_default().merge(&entry);
        }
    }

    /// Spawn the background flush task (no-op if already running)
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.is_shutting_down() {
            return;
        }

        let this = Arc::clone(self);
        let mut cancel = self.cancel.subscribe();
        *task = Some(tokio::spawn(async move {
            debug!(
                interval_ms = this.settings.flush_interval_ms,
                max_batch_size = this.settings.max_batch_size,
                "Usage flush task started"
            );
            loop {
                let delay = this.settings.next_delay(this.consecutive_failures());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = this.batch_full.notified() => {
                        debug!("Pending usage reached batch size, flushing early");
                    }
                    _ = cancel.changed() => break,
                }
                if *cancel.borrow() {
                    break;
                }
                this.flush().await;
            }
            debug!("Usage flush task stopped");
        }));
    }

    /// Stop accepting events, stop the timer, and flush what is left.
    ///
    /// The timer task is cancelled and joined before the final flush, so the
    /// final flush is the last store write this aggregator makes.
    pub async fn shutdown(&self) -> FlushOutcome {
        {
            let _pending = self.pending.lock();
            self.shutting_down.store(true, Ordering::Release);
        }
        self.cancel.send_replace(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Usage flush task ended abnormally: {}", e);
            }
        }

        let outcome = self.flush().await;
        if outcome.is_failure() {
            warn!(
                pending = self.pending_entries(),
                "Final usage flush failed; pending counters were not persisted"
            );
        }
        outcome
    }

    fn consecutive_failures(&self) -> u32 {
        self.stats.lock().consecutive_failures
    }

    pub fn status(&self) -> UsageStatus {
        let stats = self.stats.lock();
        UsageStatus {
            pending_entries: self.pending_entries(),
            max_batch_size: self.settings.max_batch_size,
            flush_interval_ms: self.settings.flush_interval_ms,
            flush_timeout_ms: self.settings.flush_timeout_ms,
            shutting_down: self.is_shutting_down(),
            consecutive_failures: stats.consecutive_failures,
            last_flush: stats.last_flush.clone(),
            last_flush_at: stats.last_flush_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::usage::store::{AbortSignal, MemoryCounterStore};
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Store that fails while `failing` is set and records successful writes
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        calls: AtomicU32,
        inner: MemoryCounterStore,
    }

    impl CounterStore for FlakyStore {
        async fn upsert_add(&self, rows: &[UsageRow], abort: AbortSignal) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("counter store unavailable");
            }
            self.inner.upsert_add(rows, abort).await
        }
    }

    /// Store that never answers until the write is aborted
    struct HangingStore;

    impl CounterStore for HangingStore {
        async fn upsert_add(
            &self,
            _rows: &[UsageRow],
            mut abort: AbortSignal,
        ) -> anyhow::Result<()> {
            while !*abort.borrow_and_update() {
                if abort.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            anyhow::bail!("write rolled back")
        }
    }

    /// Store that commits late and ignores aborts
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryCounterStore,
    }

    impl CounterStore for SlowStore {
        async fn upsert_add(&self, rows: &[UsageRow], abort: AbortSignal) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.upsert_add(rows, abort).await
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn aggregator<S: CounterStore + 'static>(
        store: Arc<S>,
        settings: UsageSettings,
    ) -> (Arc<UsageAggregator<S>>, Arc<ManualClock>) {
        let clock = clock();
        let agg = Arc::new(UsageAggregator::new(settings, clock.clone(), store));
        (agg, clock)
    }

    fn track_n<S: CounterStore + 'static>(agg: &Arc<UsageAggregator<S>>, tenant: &str, n: usize) {
        for _ in 0..n {
            assert!(agg.track(tenant, UsageEvent::Explanation, Some(TokenUsage::new(10, 2))));
        }
    }

    #[tokio::test]
    async fn test_flushes_are_additive() {
        let store = Arc::new(MemoryCounterStore::new());
        let (agg, _) = aggregator(store.clone(), UsageSettings::default());

        track_n(&agg, "acme", 5);
        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { rows: 1, .. }));
        track_n(&agg, "acme", 5);
        agg.flush().await;

        let totals = store.usage_for("acme", day()).unwrap();
        assert_eq!(totals.explanations, 10);
        assert_eq!(totals.tokens_in, 100);
        assert_eq!(totals.tokens_out, 20);
        assert_eq!(agg.pending_entries(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_skips_store() {
        let store = Arc::new(FlakyStore::default());
        let (agg, _) = aggregator(store.clone(), UsageSettings::default());
        assert_eq!(agg.flush().await, FlushOutcome::Empty);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_without_loss_or_double_count() {
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let (agg, _) = aggregator(store.clone(), UsageSettings::default());

        track_n(&agg, "acme", 4);
        let outcome = agg.flush().await;
        assert!(outcome.is_failure());
        assert_eq!(outcome.rows(), 1);
        assert_eq!(agg.status().consecutive_failures, 1);

        // Tracked while the store was down; must add to the re-queued batch
        track_n(&agg, "acme", 3);
        let key = UsageKey {
            tenant_id: "acme".to_string(),
            day: day(),
        };
        assert_eq!(agg.pending_for(&key).unwrap().explanations, 7);

        store.failing.store(false, Ordering::SeqCst);
        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { .. }));
        assert_eq!(agg.flush().await, FlushOutcome::Empty);

        assert_eq!(store.inner.usage_for("acme", day()).unwrap().explanations, 7);
        assert_eq!(agg.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_store_timeout_is_a_failure() {
        let settings = UsageSettings {
            flush_timeout_ms: 20,
            ..UsageSettings::default()
        };
        let (agg, _) = aggregator(Arc::new(HangingStore), settings);

        track_n(&agg, "acme", 2);
        let outcome = agg.flush().await;
        match outcome {
            FlushOutcome::Failed { error, .. } => assert!(error.contains("20ms")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(agg.pending_entries(), 1);
    }

    #[tokio::test]
    async fn test_late_commit_after_timeout_is_not_requeued() {
        let store = Arc::new(SlowStore::default());
        let settings = UsageSettings {
            flush_timeout_ms: 20,
            ..UsageSettings::default()
        };
        let (agg, _) = aggregator(store.clone(), settings);

        track_n(&agg, "acme", 5);
        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { rows: 1, .. }));
        assert_eq!(agg.pending_entries(), 0);
        assert_eq!(agg.flush().await, FlushOutcome::Empty);
        assert_eq!(store.inner.usage_for("acme", day()).unwrap().explanations, 5);
    }

    #[tokio::test]
    async fn test_failing_store_is_retried_on_the_timer_only() {
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let settings = UsageSettings {
            flush_interval_ms: 60_000,
            max_batch_size: 1,
            backoff_enabled: true,
            ..UsageSettings::default()
        };
        let (agg, _) = aggregator(store.clone(), settings);
        agg.start();

        for i in 0..50 {
            agg.track(&format!("tenant-{}", i % 3), UsageEvent::Explanation, None);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(agg.status().consecutive_failures, 1);
        store.failing.store(false, Ordering::SeqCst);
        agg.shutdown().await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_shutdown_keeps_every_accepted_event() {
        for _ in 0..50 {
            let store = Arc::new(MemoryCounterStore::new());
            let (agg, _) = aggregator(store.clone(), UsageSettings::default());
            agg.start();

            let trackers: Vec<_> = (0..4)
                .map(|_| {
                    let agg = Arc::clone(&agg);
                    std::thread::spawn(move || {
                        let mut accepted = 0u64;
                        while agg.track("acme", UsageEvent::Explanation, None) {
                            accepted += 1;
                        }
                        accepted
                    })
                })
                .collect();

            while agg.pending_entries() == 0 {
                tokio::task::yield_now().await;
            }
            agg.shutdown().await;

            let accepted: u64 = trackers.into_iter().map(|t| t.join().unwrap()).sum();
            let stored = store
                .usage_for("acme", day())
                .map(|entry| entry.explanations)
                .unwrap_or(0);
            assert_eq!(stored, accepted);
            assert_eq!(agg.pending_entries(), 0);
        }
    }

    #[tokio::test]
    async fn test_entries_are_keyed_by_utc_day() {
        let store = Arc::new(MemoryCounterStore::new());
        let (agg, clock) = aggregator(store.clone(), UsageSettings::default());

        track_n(&agg, "acme", 1);
        clock.advance(Duration::from_secs(13 * 3600));
        track_n(&agg, "acme", 2);
        agg.track("acme", UsageEvent::PdfExport, None);
        assert_eq!(agg.pending_entries(), 2);

        agg.flush().await;
        let next_day = day().succ_opt().unwrap();
        assert_eq!(store.usage_for("acme", day()).unwrap().explanations, 1);
        let second = store.usage_for("acme", next_day).unwrap();
        assert_eq!(second.explanations, 2);
        assert_eq!(second.pdf_exports, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_events() {
        let store = Arc::new(MemoryCounterStore::new());
        let (agg, _) = aggregator(store.clone(), UsageSettings::default());
        agg.start();

        track_n(&agg, "acme", 3);
        track_n(&agg, "globex", 1);

        let outcome = agg.shutdown().await;
        assert_eq!(outcome.rows(), 2);
        assert_eq!(store.usage_for("acme", day()).unwrap().explanations, 3);

        assert!(!agg.track("acme", UsageEvent::Explanation, None));
        assert_eq!(agg.pending_entries(), 0);
        assert!(agg.status().shutting_down);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_early_flush() {
        let store = Arc::new(MemoryCounterStore::new());
        let settings = UsageSettings {
            flush_interval_ms: 60_000,
            max_batch_size: 3,
            ..UsageSettings::default()
        };
        let (agg, _) = aggregator(store.clone(), settings);
        agg.start();

        for tenant in ["a", "b", "c"] {
            agg.track(tenant, UsageEvent::Explanation, None);
        }

        let mut flushed = false;
        for _ in 0..100 {
            if store.len() == 3 {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed, "batch size should wake the flush task");
        agg.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_periodically() {
        let store = Arc::new(MemoryCounterStore::new());
        let (agg, _) = aggregator(store.clone(), UsageSettings::default());
        agg.start();

        track_n(&agg, "acme", 2);
        tokio::time::sleep(Duration::from_millis(30_001)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.usage_for("acme", day()).unwrap().explanations, 2);
        assert!(matches!(
            agg.status().last_flush,
            Some(FlushOutcome::Flushed { rows: 1, .. })
        ));
        agg.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_outcomes_are_published() {
        let (tx, mut rx) = broadcast::channel(8);
        let store = Arc::new(MemoryCounterStore::new());
        let agg = UsageAggregator::new(UsageSettings::default(), clock(), store).with_events(tx);

        agg.flush().await;
        agg.track("acme", UsageEvent::Explanation, None);
        agg.flush().await;

        let published = rx.try_recv().unwrap();
        assert!(matches!(published, FlushOutcome::Flushed { rows: 1, .. }));
        assert!(rx.try_recv().is_err());
    }
}
