//! SQLite-backed counter store.
//!
//! Totals live in `tenant_usage_daily`, one row per (tenant, day). A batch is
//! applied in a single transaction with `ON CONFLICT ... DO UPDATE` adding
//! the incoming counters to the stored ones.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};

use super::store::{AbortSignal, CounterStore};
use super::types::{UsageBatchEntry, UsageRow};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS tenant_usage_daily (
        tenant_id          TEXT    NOT NULL,
        day                TEXT    NOT NULL,
        explanations_count INTEGER NOT NULL DEFAULT 0,
        pdf_exports_count  INTEGER NOT NULL DEFAULT 0,
        tokens_in          INTEGER NOT NULL DEFAULT 0,
        tokens_out         INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tenant_id, day)
    );
";

const UPSERT_ADD: &str = "
    INSERT INTO tenant_usage_daily
        (tenant_id, day, explanations_count, pdf_exports_count, tokens_in, tokens_out)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT (tenant_id, day) DO UPDATE SET
        explanations_count = explanations_count + excluded.explanations_count,
        pdf_exports_count  = pdf_exports_count + excluded.pdf_exports_count,
        tokens_in          = tokens_in + excluded.tokens_in,
        tokens_out         = tokens_out + excluded.tokens_out
";

/// Waiting on a locked database counts against the flush timeout
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Counter store writing to a local SQLite database
#[derive(Clone)]
pub struct SqliteCounterStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteCounterStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {:?}", parent)
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open usage database: {:?}", path))?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create tenant_usage_daily")?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    /// Stored totals for one tenant and day
    pub async fn usage_for(&self, tenant_id: &str, day: NaiveDate) -> Result<Option<UsageBatchEntry>> {
        let conn = Arc::clone(&self.conn);
        let tenant_id = tenant_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            read_usage(&conn, &tenant_id, day)
        })
        .await
        .context("Usage read task failed")?
    }
}

impl CounterStore for SqliteCounterStore {
    /// Runs the batch on the blocking pool and always waits for it to finish.
    ///
    /// An abort interrupts a running statement and stops a write still queued
    /// on the connection lock from starting; the result reports whether the
    /// transaction committed.
    async fn upsert_add(&self, rows: &[UsageRow], mut abort: AbortSignal) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let rows = rows.to_vec();
        let aborted = Arc::new(AtomicBool::new(*abort.borrow()));
        let write = {
            let aborted = Arc::clone(&aborted);
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock();
                write_batch(&mut conn, &rows, &aborted)
            })
        };
        tokio::pin!(write);

        let mut listening = !aborted.load(Ordering::SeqCst);
        loop {
            tokio::select! {
                result = &mut write => {
                    return result.context("Usage write task failed")?;
                }
                changed = abort.changed(), if listening => match changed {
                    Ok(()) if *abort.borrow() => {
                        aborted.store(true, Ordering::SeqCst);
                        self.interrupt.interrupt();
                        listening = false;
                    }
                    Ok(()) => {}
                    Err(_) => listening = false,
                },
            }
        }
    }
}

fn write_batch(conn: &mut Connection, rows: &[UsageRow], aborted: &AtomicBool) -> Result<()> {
    if aborted.load(Ordering::SeqCst) {
        anyhow::bail!("usage write aborted before it started");
    }
    let tx = conn.transaction().context("begin transaction")?;
    {
        let mut stmt = tx.prepare_cached(UPSERT_ADD).context("prepare upsert")?;
        for row in rows {
            stmt.execute(params![
                row.tenant_id,
                row.day.to_string(),
                to_sql_int(row.explanations)?,
                to_sql_int(row.pdf_exports)?,
                to_sql_int(row.tokens_in)?,
                to_sql_int(row.tokens_out)?,
            ])
            .with_context(|| format!("upsert usage for tenant {} on {}", row.tenant_id, row.day))?;
        }
    }
    if aborted.load(Ordering::SeqCst) {
        // Dropping an uncommitted transaction rolls it back
        anyhow::bail!("usage write aborted before commit");
    }
    tx.commit().context("commit usage batch")
}

fn read_usage(conn: &Connection, tenant_id: &str, day: NaiveDate) -> Result<Option<UsageBatchEntry>> {
    let row = conn
        .query_row(
            "SELECT explanations_count, pdf_exports_count, tokens_in, tokens_out
             FROM tenant_usage_daily WHERE tenant_id = ?1 AND day = ?2",
            params![tenant_id, day.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .context("query tenant_usage_daily")?;

    Ok(row.map(|(explanations, pdf_exports, tokens_in, tokens_out)| UsageBatchEntry {
        explanations: explanations.max(0) as u64,
        pdf_exports: pdf_exports.max(0) as u64,
        tokens_in: tokens_in.max(0) as u64,
        tokens_out: tokens_out.max(0) as u64,
    }))
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter {} exceeds SQLite INTEGER range", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::UsageSettings;
    use crate::usage::{FlushOutcome, TokenUsage, UsageAggregator, UsageEvent};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()
    }

    fn row(tenant: &str, explanations: u64, tokens_in: u64, tokens_out: u64) -> UsageRow {
        UsageRow {
            tenant_id: tenant.to_string(),
            day: day(),
            explanations,
            pdf_exports: 0,
            tokens_in,
            tokens_out,
        }
    }

    fn no_abort() -> AbortSignal {
        watch::channel(false).1
    }

    fn aggregator(
        store: &Arc<SqliteCounterStore>,
        settings: UsageSettings,
    ) -> Arc<UsageAggregator<SqliteCounterStore>> {
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        ));
        Arc::new(UsageAggregator::new(settings, clock, Arc::clone(store)))
    }

    fn track_n(agg: &UsageAggregator<SqliteCounterStore>, tenant: &str, n: usize) {
        for _ in 0..n {
            assert!(agg.track(tenant, UsageEvent::Explanation, Some(TokenUsage::new(10, 2))));
        }
    }

    #[tokio::test]
    async fn test_upsert_adds_to_existing_totals() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCounterStore::open(&dir.path().join("usage.db")).unwrap();

        store
            .upsert_add(&[row("acme", 5, 500, 100)], no_abort())
            .await
            .unwrap();
        store
            .upsert_add(&[row("acme", 10, 250, 50)], no_abort())
            .await
            .unwrap();

        let totals = store.usage_for("acme", day()).await.unwrap().unwrap();
        assert_eq!(
            totals,
            UsageBatchEntry {
                explanations: 15,
                pdf_exports: 0,
                tokens_in: 750,
                tokens_out: 150,
            }
        );
        assert!(store.usage_for("globex", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_totals_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usage.db");

        let store = SqliteCounterStore::open(&path).unwrap();
        store
            .upsert_add(&[row("acme", 3, 0, 0)], no_abort())
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteCounterStore::open(&path).unwrap();
        let totals = reopened.usage_for("acme", day()).await.unwrap().unwrap();
        assert_eq!(totals.explanations, 3);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        let overflow = UsageRow {
            tokens_in: u64::MAX,
            ..row("globex", 1, 0, 0)
        };

        let result = store
            .upsert_add(&[row("acme", 1, 0, 0), overflow], no_abort())
            .await;
        assert!(result.is_err());
        assert!(store.usage_for("acme", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abort_before_lock_rolls_back() {
        let store = SqliteCounterStore::open_in_memory().unwrap();
        let (abort_tx, abort_rx) = watch::channel(false);

        let conn = Arc::clone(&store.conn);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _held = conn.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });
        locked_rx.recv().unwrap();

        let rows = [row("acme", 2, 0, 0)];
        let write = store.upsert_add(&rows, abort_rx);
        abort_tx.send_replace(true);
        assert!(write.await.is_err());

        holder.join().unwrap();
        assert!(store.usage_for("acme", day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flushes_through_sqlite_are_additive() {
        let store = Arc::new(SqliteCounterStore::open_in_memory().unwrap());
        let agg = aggregator(&store, UsageSettings::default());

        track_n(&agg, "acme", 5);
        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { rows: 1, .. }));
        track_n(&agg, "acme", 5);
        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { rows: 1, .. }));

        let totals = store.usage_for("acme", day()).await.unwrap().unwrap();
        assert_eq!(totals.explanations, 10);
        assert_eq!(totals.tokens_in, 100);
        assert_eq!(totals.tokens_out, 20);
    }

    #[tokio::test]
    async fn test_timed_out_flush_is_counted_once() {
        let store = Arc::new(SqliteCounterStore::open_in_memory().unwrap());
        let settings = UsageSettings {
            flush_timeout_ms: 50,
            ..UsageSettings::default()
        };
        let agg = aggregator(&store, settings);
        track_n(&agg, "acme", 5);

        // Keep the connection busy well past the flush timeout
        let conn = Arc::clone(&store.conn);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _held = conn.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        locked_rx.recv().unwrap();

        let first = agg.flush().await;
        match &first {
            FlushOutcome::Failed { error, .. } => assert!(error.contains("50ms"), "{}", error),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(agg.pending_entries(), 1);
        holder.join().unwrap();

        assert!(matches!(agg.flush().await, FlushOutcome::Flushed { rows: 1, .. }));
        let totals = store.usage_for("acme", day()).await.unwrap().unwrap();
        assert_eq!(totals.explanations, 5);
        assert_eq!(agg.pending_entries(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_into_sqlite() {
        let store = Arc::new(SqliteCounterStore::open_in_memory().unwrap());
        let agg = aggregator(&store, UsageSettings::default());
        agg.start();

        track_n(&agg, "acme", 3);
        track_n(&agg, "globex", 2);
        let outcome = agg.shutdown().await;

        assert_eq!(outcome.rows(), 2);
        assert_eq!(agg.pending_entries(), 0);
        assert!(!agg.track("acme", UsageEvent::Explanation, None));
        let acme = store.usage_for("acme", day()).await.unwrap().unwrap();
        let globex = store.usage_for("globex", day()).await.unwrap().unwrap();
        assert_eq!(acme.explanations, 3);
        assert_eq!(globex.explanations, 2);
    }
}
