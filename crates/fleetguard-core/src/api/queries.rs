//! Read-only query methods on [`FleetGuard`].
//!
//! Every method takes the component's lock internally, copies what it needs
//! into owned values, and releases the lock before returning.

use crate::circuit::CircuitStatusReport;
use crate::rules::{classify, most_severe, needs_explanation, MetricSnapshot};
use crate::usage::{CounterStore, UsageStatus};

use super::core::FleetGuard;
use super::types::{Assessment, HealthReport, HealthState};

impl<S: CounterStore + 'static> FleetGuard<S> {
    // =========================================================
    // Rule queries
    // =========================================================

    /// Evaluate a snapshot and derive status, top finding, and whether an
    /// explanation is warranted
    pub fn assess(&self, snapshot: &MetricSnapshot) -> Assessment {
        let findings = self.evaluator().evaluate(snapshot);
        Assessment {
            tenant_id: snapshot.tenant_id.clone(),
            vehicle_id: snapshot.vehicle_id.clone(),
            status: classify(&findings),
            needs_explanation: needs_explanation(&findings),
            most_severe: most_severe(&findings).cloned(),
            findings,
        }
    }

    // =========================================================
    // Status queries
    // =========================================================

    /// Circuit status for one tenant, or for every tracked tenant
    pub fn circuit_status(&self, tenant: Option<&str>) -> CircuitStatusReport {
        self.circuits().status(tenant)
    }

    pub fn usage_status(&self) -> UsageStatus {
        self.usage().status()
    }

    /// Degraded while the global circuit rejects calls or flushes keep failing
    pub fn health(&self) -> HealthReport {
        let global = self.circuits().global_status();
        let usage = self.usage().status();

        let degraded = global.is_open || usage.consecutive_failures > 0;
        HealthReport {
            status: if degraded {
                HealthState::Degraded
            } else {
                HealthState::Ok
            },
            global_circuit: global.phase,
            tracked_tenants: self.circuits().tracked_tenants(),
            pending_usage_entries: usage.pending_entries,
            consecutive_flush_failures: usage.consecutive_failures,
            shutting_down: usage.shutting_down,
        }
    }
}
