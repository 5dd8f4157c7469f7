//! Usage data types: events, per-day counters, flush results.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A billable action performed for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEvent {
    /// An explanation was requested from the inference service
    Explanation,
    /// A PDF report was exported
    PdfExport,
}

/// Token counts reported by the inference service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl TokenUsage {
    pub fn new(tokens_in: u64, tokens_out: u64) -> Self {
        Self {
            tokens_in,
            tokens_out,
        }
    }
}

/// Pending counters are keyed by tenant and UTC day
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub tenant_id: String,
    pub day: NaiveDate,
}

/// Counters accumulated for one (tenant, day) since the last flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageBatchEntry {
    pub explanations: u64,
    pub pdf_exports: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl UsageBatchEntry {
    /// Count one event
    pub fn record(&mut self, event: UsageEvent, tokens: Option<TokenUsage>) {
        match event {
            UsageEvent::Explanation => self.explanations += 1,
            UsageEvent::PdfExport => self.pdf_exports += 1,
        }
        if let Some(tokens) = tokens {
            self.tokens_in += tokens.tokens_in;
            self.tokens_out += tokens.tokens_out;
        }
    }

    /// Add another entry's counters (never replace)
    pub fn merge(&mut self, other: &UsageBatchEntry) {
        self.explanations += other.explanations;
        self.pdf_exports += other.pdf_exports;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }
}

/// One row handed to a counter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRow {
    pub tenant_id: String,
    pub day: NaiveDate,
    pub explanations: u64,
    pub pdf_exports: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl UsageRow {
    pub fn new(key: &UsageKey, entry: &UsageBatchEntry) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            day: key.day,
            explanations: entry.explanations,
            pdf_exports: entry.pdf_exports,
            tokens_in: entry.tokens_in,
            tokens_out: entry.tokens_out,
        }
    }

    pub fn key(&self) -> UsageKey {
        UsageKey {
            tenant_id: self.tenant_id.clone(),
            day: self.day,
        }
    }

    pub fn entry(&self) -> UsageBatchEntry {
        UsageBatchEntry {
            explanations: self.explanations,
            pdf_exports: self.pdf_exports,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        }
    }
}

/// Result of one flush attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// The batch was written
    Flushed {
        batch_id: String,
        rows: usize,
        duration_ms: u64,
    },
    /// The store call failed or timed out; the batch was re-queued
    Failed {
        batch_id: String,
        rows: usize,
        error: String,
    },
}

impl FlushOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FlushOutcome::Failed { .. })
    }

    /// Rows carried by the batch (zero when empty)
    pub fn rows(&self) -> usize {
        match self {
            FlushOutcome::Empty => 0,
            FlushOutcome::Flushed { rows, .. } | FlushOutcome::Failed { rows, .. } => *rows,
        }
    }
}

/// Aggregator status for health and status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    /// Distinct (tenant, day) entries waiting for a flush
    pub pending_entries: usize,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub flush_timeout_ms: u64,
    pub shutting_down: bool,
    pub consecutive_failures: u32,
    pub last_flush: Option<FlushOutcome>,
    pub last_flush_at: Option<DateTime<Utc>>,
}
