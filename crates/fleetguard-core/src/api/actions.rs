//! Action methods on [`FleetGuard`].
//!
//! Reporting, usage tracking, the composed explanation flow, and the
//! background task lifecycle.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitDecision, FailureKind};
use crate::rules::MetricSnapshot;
use crate::usage::{CounterStore, FlushOutcome, TokenUsage, UsageEvent};

use super::core::FleetGuard;
use super::types::{Assessment, Explanation, GuardError, InferenceError, InferenceOutcome};

/// Operation name used when the composed flow checks the circuit
const EXPLANATION_OPERATION: &str = "explanation";

impl<S: CounterStore + 'static> FleetGuard<S> {
    // =========================================================
    // Circuit actions
    // =========================================================

    /// Ask whether a call for `tenant` may proceed
    pub fn check(&self, tenant: &str, operation: &str) -> CircuitDecision {
        self.circuits().check(tenant, operation)
    }

    pub fn record_success(&self, tenant: &str) {
        self.circuits().record_success(tenant);
    }

    pub fn record_failure(&self, tenant: &str, kind: FailureKind) {
        self.circuits().record_failure(tenant, kind);
    }

    // =========================================================
    // Usage actions
    // =========================================================

    /// Count a usage event; false once shutdown has begun
    pub fn track(&self, tenant: &str, event: UsageEvent, tokens: Option<TokenUsage>) -> bool {
        self.usage().track(tenant, event, tokens)
    }

    /// Flush pending usage now, surfacing a failed write as an error.
    ///
    /// The failed batch has already been re-queued when this returns `Err`.
    pub async fn flush_usage(&self) -> Result<FlushOutcome, GuardError> {
        match self.usage().flush().await {
            FlushOutcome::Failed { batch_id, error, .. } => Err(GuardError::Store(anyhow!(
                "batch {} failed: {}",
                batch_id,
                error
            ))),
            outcome => Ok(outcome),
        }
    }

    // =========================================================
    // Composed flow
    // =========================================================

    /// Evaluate, gate, call, report, and track in one step.
    ///
    /// 1. Returns [`GuardError::NotWarranted`] when no finding is a hit.
    /// 2. Returns [`GuardError::CircuitOpen`] without invoking `call` when
    ///    the global or tenant circuit rejects.
    /// 3. Otherwise invokes `call`, reports the outcome to the circuit
    ///    registry, and records one explanation event whether the call
    ///    succeeded or failed.
    pub async fn run_explanation<F, Fut>(
        &self,
        tenant: &str,
        snapshot: &MetricSnapshot,
        call: F,
    ) -> Result<Explanation, GuardError>
    where
        F: FnOnce(Assessment) -> Fut,
        Fut: Future<Output = Result<InferenceOutcome, InferenceError>>,
    {
        let assessment = self.assess(snapshot);
        if !assessment.needs_explanation {
            debug!(tenant = %tenant, vehicle = %snapshot.vehicle_id, "No hit, skipping explanation");
            return Err(GuardError::NotWarranted);
        }

        self.check(tenant, EXPLANATION_OPERATION).into_result()?;

        let result = call(assessment.clone()).await;
        let tokens = match &result {
            Ok(outcome) => {
                self.record_success(tenant);
                outcome.tokens
            }
            Err(e) => {
                warn!(tenant = %tenant, kind = %e.kind, "Explanation call failed: {}", e.message);
                self.record_failure(tenant, e.kind);
                None
            }
        };
        self.track(tenant, UsageEvent::Explanation, tokens);

        let outcome = result?;
        Ok(Explanation {
            assessment,
            outcome,
        })
    }

    // =========================================================
    // Lifecycle
    // =========================================================

    /// Spawn the usage flush task, the idle circuit sweep, and the event
    /// bridge. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks().lock();
        if tasks.started {
            return;
        }
        tasks.started = true;

        self.usage().start();
        let sweeper = Arc::clone(self.circuits()).spawn_sweeper(self.shutdown_signal().subscribe());
        tasks.handles.push(sweeper);
        tasks.handles.push(self.spawn_event_bridge());

        info!(
            flush_interval_ms = self.settings().usage.flush_interval_ms,
            max_batch_size = self.settings().usage.max_batch_size,
            "Background tasks started"
        );
    }

    /// Stop background work and drain pending usage.
    ///
    /// Stops accepting usage events, cancels and joins the flush timer,
    /// performs the final flush, then stops the sweep and event bridge.
    pub async fn shutdown(&self) -> FlushOutcome {
        info!("Shutting down, draining usage");
        let outcome = self.usage().shutdown().await;

        self.shutdown_signal().send_replace(true);
        let handles = std::mem::take(&mut self.tasks().lock().handles);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        match &outcome {
            FlushOutcome::Failed { rows, .. } => {
                warn!(rows, "Shutdown complete with unflushed usage")
            }
            _ => info!(rows = outcome.rows(), "Shutdown complete"),
        }
        outcome
    }
}
