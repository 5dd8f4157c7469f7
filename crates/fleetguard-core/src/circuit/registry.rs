//! CircuitBreakerRegistry: per-tenant and global failure state.
//!
//! One mutex guards the global circuit and the tenant map together, so the
//! lazy Open → HalfOpen reset inside `check` is observed atomically by any
//! `record_*` that follows it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    CircuitDecision, CircuitPhase, CircuitScope, CircuitSnapshot, CircuitState,
    CircuitStatusReport, CircuitTransition, FailureKind, PhaseLabel,
};
use crate::clock::{Clock, SharedClock};
use crate::config::{CircuitSettings, Threshold};

struct RegistryInner {
    global: CircuitState,
    tenants: HashMap<String, CircuitState>,
}

/// Registry of circuit breakers keyed by tenant, plus one global circuit
pub struct CircuitBreakerRegistry {
    settings: CircuitSettings,
    clock: SharedClock,
    inner: Mutex<RegistryInner>,
    events: Option<broadcast::Sender<CircuitTransition>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitSettings, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            settings,
            clock,
            inner: Mutex::new(RegistryInner {
                global: CircuitState::new(now),
                tenants: HashMap::new(),
            }),
            events: None,
        }
    }

    /// Publish phase transitions on the given channel
    pub fn with_events(mut self, tx: broadcast::Sender<CircuitTransition>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    /// Number of tenant circuits held in memory
    pub fn tracked_tenants(&self) -> usize {
        self.inner.lock().tenants.len()
    }

    // =========================================================
    // Gate
    // =========================================================

    /// Decide whether a call for `tenant` may proceed.
    ///
    /// The global circuit is consulted first. An open circuit whose timeout
    /// has elapsed is reset here (failures to zero, one more half-open
    /// attempt) and the call is let through as a probe. Repeated checks with
    /// no report in between return the same verdict.
    pub fn check(&self, tenant: &str, operation: &str) -> CircuitDecision {
        let now = self.clock.now();
        let mut transitions = Vec::new();

        let decision = {
            let mut guard = self.inner.lock();
            let RegistryInner { global, tenants } = &mut *guard;

            let global_threshold = global
                .last_failure_kind
                .and_then(|kind| self.settings.global_threshold(kind));
            let global_gate = gate(&CircuitScope::Global, global, global_threshold, now);

            if let Some(retry_after) = global_gate.retry_after {
                reject(CircuitScope::Global, retry_after)
            } else {
                transitions.extend(global_gate.transition);
                match tenants.get_mut(tenant) {
                    Some(state) => {
                        state.last_activity = now;
                        let threshold = state
                            .last_failure_kind
                            .map(|kind| self.settings.tenant_threshold(kind));
                        let scope = CircuitScope::tenant(tenant);
                        let tenant_gate = gate(&scope, state, threshold, now);
                        transitions.extend(tenant_gate.transition);
                        match tenant_gate.retry_after {
                            Some(retry_after) => reject(scope, retry_after),
                            None => CircuitDecision::allow(),
                        }
                    }
                    None => CircuitDecision::allow(),
                }
            }
        };

        if !decision.allowed {
            debug!(
                tenant = %tenant,
                operation = %operation,
                retry_after_ms = decision.retry_after_ms.unwrap_or(0),
                "Call rejected by open circuit"
            );
        }
        self.emit(transitions);
        decision
    }

    // =========================================================
    // Reports
    // =========================================================

    /// Record a failed call for `tenant`.
    ///
    /// Creates the tenant entry on first failure. Failure kinds listed in
    /// `global_mirrored_kinds` also count toward the global circuit.
    pub fn record_failure(&self, tenant: &str, kind: FailureKind) {
        let now = self.clock.now();
        let mut transitions = Vec::new();

        {
            let mut guard = self.inner.lock();
            let RegistryInner { global, tenants } = &mut *guard;

            if !tenants.contains_key(tenant) {
                make_room(tenants, self.settings.max_tenants);
            }
            let state = tenants
                .entry(tenant.to_string())
                .or_insert_with(|| CircuitState::new(now));
            transitions.extend(trip(
                CircuitScope::tenant(tenant),
                state,
                self.settings.tenant_threshold(kind),
                kind,
                now,
            ));

            if self.settings.mirrors_to_global(kind) {
                if let Some(threshold) = self.settings.global_threshold(kind) {
                    transitions.extend(trip(CircuitScope::Global, global, threshold, kind, now));
                }
            }
        }

        self.emit(transitions);
    }

    /// Record a successful call for `tenant`.
    ///
    /// Decrements the tenant failure counter (saturating) and decays the
    /// global counter by one. A half-open circuit closes; an open circuit
    /// closes once its counter reaches zero.
    pub fn record_success(&self, tenant: &str) {
        let now = self.clock.now();
        let mut transitions = Vec::new();

        {
            let mut guard = self.inner.lock();
            let RegistryInner { global, tenants } = &mut *guard;

            if let Some(state) = tenants.get_mut(tenant) {
                state.last_activity = now;
                transitions.extend(recover(CircuitScope::tenant(tenant), state));
            }
            transitions.extend(recover(CircuitScope::Global, global));
        }

        self.emit(transitions);
    }

    // =========================================================
    // Status
    // =========================================================

    /// Snapshot of the global circuit alone
    pub fn global_status(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let guard = self.inner.lock();
        let threshold = guard
            .global
            .last_failure_kind
            .and_then(|kind| self.settings.global_threshold(kind));
        snapshot(CircuitScope::Global, &guard.global, threshold, now)
    }

    /// Snapshot the global circuit and either one tenant or all tenants
    pub fn status(&self, tenant: Option<&str>) -> CircuitStatusReport {
        let now = self.clock.now();
        let guard = self.inner.lock();

        let global_threshold = guard
            .global
            .last_failure_kind
            .and_then(|kind| self.settings.global_threshold(kind));
        let global = snapshot(CircuitScope::Global, &guard.global, global_threshold, now);

        let tenant_snapshot = |id: &str, state: &CircuitState| {
            let threshold = state
                .last_failure_kind
                .map(|kind| self.settings.tenant_threshold(kind));
            snapshot(CircuitScope::tenant(id), state, threshold, now)
        };

        let tenants = match tenant {
            Some(id) => {
                let snap = match guard.tenants.get(id) {
                    Some(state) => tenant_snapshot(id, state),
                    None => tenant_snapshot(id, &CircuitState::new(now)),
                };
                vec![snap]
            }
            None => {
                let mut all: Vec<_> = guard
                    .tenants
                    .iter()
                    .map(|(id, state)| tenant_snapshot(id, state))
                    .collect();
                all.sort_by(|a, b| a.scope.to_string().cmp(&b.scope.to_string()));
                all
            }
        };

        CircuitStatusReport {
            global,
            tenants,
            tracked_tenants: guard.tenants.len(),
        }
    }

    // =========================================================
    // Eviction
    // =========================================================

    /// Drop closed, failure-free tenant entries idle longer than the TTL.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.settings.idle_ttl();
        let mut guard = self.inner.lock();

        let before = guard.tenants.len();
        guard.tenants.retain(|_, state| {
            let idle = now.saturating_duration_since(state.last_activity);
            !(state.phase == CircuitPhase::Closed && state.failures == 0 && idle > ttl)
        });
        let removed = before - guard.tenants.len();

        if removed > 0 {
            debug!(removed, remaining = guard.tenants.len(), "Swept idle tenant circuits");
        }
        removed
    }

    /// Run `sweep_idle` every `sweep_interval_secs` until `shutdown` flips
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.sweep_idle();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Circuit sweeper stopped");
        })
    }

    fn emit(&self, transitions: Vec<CircuitTransition>) {
        if let Some(tx) = &self.events {
            for transition in transitions {
                // No subscribers is fine
                let _ = tx.send(transition);
            }
        }
    }
}

struct Gate {
    retry_after: Option<Duration>,
    transition: Option<CircuitTransition>,
}

/// Apply the lazy reset to one circuit and report whether it still rejects
fn gate(
    scope: &CircuitScope,
    state: &mut CircuitState,
    threshold: Option<Threshold>,
    now: Instant,
) -> Gate {
    if !matches!(state.phase, CircuitPhase::Open { .. }) {
        return Gate {
            retry_after: None,
            transition: None,
        };
    }

    let timeout = threshold.map(|t| t.timeout()).unwrap_or(Duration::ZERO);
    if let Some(remaining) = state.open_remaining(timeout, now) {
        return Gate {
            retry_after: Some(remaining),
            transition: None,
        };
    }

    state.failures = 0;
    state.half_open_attempts += 1;
    state.phase = CircuitPhase::HalfOpen;
    info!(
        scope = %scope,
        attempt = state.half_open_attempts,
        "Circuit timeout elapsed, admitting probe"
    );

    Gate {
        retry_after: None,
        transition: Some(CircuitTransition {
            scope: scope.clone(),
            from: PhaseLabel::Open,
            to: PhaseLabel::HalfOpen,
            failures: 0,
            failure_kind: state.last_failure_kind,
        }),
    }
}

fn reject(scope: CircuitScope, retry_after: Duration) -> CircuitDecision {
    let reason = format!("circuit open for {}", scope);
    CircuitDecision::reject(scope, reason, duration_ms(retry_after))
}

/// Count one failure; open the circuit once the kind's threshold is reached
fn trip(
    scope: CircuitScope,
    state: &mut CircuitState,
    threshold: Threshold,
    kind: FailureKind,
    now: Instant,
) -> Option<CircuitTransition> {
    state.failures = state.failures.saturating_add(1);
    state.last_failure = Some(now);
    state.last_failure_kind = Some(kind);
    state.last_activity = now;

    if state.failures < threshold.failures || matches!(state.phase, CircuitPhase::Open { .. }) {
        return None;
    }

    let from = state.phase.label();
    state.phase = CircuitPhase::Open { since: now };
    warn!(
        scope = %scope,
        failures = state.failures,
        kind = %kind,
        timeout_secs = threshold.timeout_secs,
        "Circuit opened"
    );

    Some(CircuitTransition {
        scope,
        from,
        to: PhaseLabel::Open,
        failures: state.failures,
        failure_kind: Some(kind),
    })
}

/// Decay one failure; close a half-open circuit or a drained open one
fn recover(scope: CircuitScope, state: &mut CircuitState) -> Option<CircuitTransition> {
    state.failures = state.failures.saturating_sub(1);
    state.half_open_attempts = 0;

    let close = match state.phase {
        CircuitPhase::HalfOpen => true,
        CircuitPhase::Open { .. } => state.failures == 0,
        CircuitPhase::Closed => false,
    };
    if !close {
        return None;
    }

    let from = state.phase.label();
    state.phase = CircuitPhase::Closed;
    info!(scope = %scope, from = %from, "Circuit closed");

    Some(CircuitTransition {
        scope,
        from,
        to: PhaseLabel::Closed,
        failures: state.failures,
        failure_kind: state.last_failure_kind,
    })
}

/// Evict the least recently active closed tenant when the map is full
fn make_room(tenants: &mut HashMap<String, CircuitState>, max_tenants: usize) {
    if tenants.len() < max_tenants {
        return;
    }

    let victim = tenants
        .iter()
        .filter(|(_, state)| state.phase == CircuitPhase::Closed)
        .min_by_key(|(_, state)| state.last_activity)
        .map(|(id, _)| id.clone());

    match victim {
        Some(id) => {
            tenants.remove(&id);
            debug!(tenant = %id, "Evicted least recently active tenant circuit");
        }
        None => {
            warn!(
                tracked = tenants.len(),
                max_tenants, "Tenant circuit cap reached with no closed entry to evict"
            );
        }
    }
}

fn snapshot(
    scope: CircuitScope,
    state: &CircuitState,
    threshold: Option<Threshold>,
    now: Instant,
) -> CircuitSnapshot {
    let timeout = threshold.map(|t| t.timeout()).unwrap_or(Duration::ZERO);
    let remaining = state.open_remaining(timeout, now);

    CircuitSnapshot {
        scope,
        phase: state.phase.label(),
        is_open: remaining.is_some(),
        failures: state.failures,
        last_failure_kind: state.last_failure_kind,
        last_failure_ago_ms: state
            .last_failure
            .map(|at| duration_ms(now.saturating_duration_since(at))),
        half_open_attempts: state.half_open_attempts,
        retry_after_ms: remaining.map(duration_ms),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn registry() -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        registry_with(CircuitSettings::default())
    }

    fn registry_with(settings: CircuitSettings) -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let registry = CircuitBreakerRegistry::new(settings, clock.clone());
        (registry, clock)
    }

    #[test]
    fn test_unseen_tenant_is_allowed_and_not_tracked() {
        let (registry, _) = registry();
        let decision = registry.check("acme", "explain");
        assert!(decision.allowed);
        assert_eq!(decision.scope, None);
        assert_eq!(registry.tracked_tenants(), 0);
    }

    #[test]
    fn test_opens_after_three_server_errors_and_resets_after_timeout() {
        let (registry, clock) = registry();

        registry.record_failure("acme", FailureKind::ServerError);
        registry.record_failure("acme", FailureKind::ServerError);
        assert!(registry.check("acme", "explain").allowed);

        registry.record_failure("acme", FailureKind::ServerError);
        let decision = registry.check("acme", "explain");
        assert!(!decision.allowed);
        assert_eq!(decision.scope, Some(CircuitScope::tenant("acme")));
        assert_eq!(decision.retry_after_ms, Some(300_000));

        clock.advance(Duration::from_secs(299));
        let decision = registry.check("acme", "explain");
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(1_000));

        clock.advance(Duration::from_secs(1));
        assert!(registry.check("acme", "explain").allowed);

        let report = registry.status(Some("acme"));
        let snap = &report.tenants[0];
        assert_eq!(snap.phase, PhaseLabel::HalfOpen);
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.half_open_attempts, 1);
        assert!(!snap.is_open);
    }

    #[test]
    fn test_check_is_idempotent() {
        let (registry, clock) = registry();
        assert_eq!(registry.check("acme", "a"), registry.check("acme", "a"));

        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        assert_eq!(registry.check("acme", "a"), registry.check("acme", "a"));

        clock.advance(Duration::from_secs(300));
        let first = registry.check("acme", "a");
        let second = registry.check("acme", "a");
        assert!(first.allowed);
        assert_eq!(first, second);
        assert_eq!(registry.status(Some("acme")).tenants[0].half_open_attempts, 1);
    }

    #[test]
    fn test_tenant_isolation() {
        let (registry, _) = registry();
        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        assert!(!registry.check("acme", "explain").allowed);
        assert!(registry.check("globex", "explain").allowed);
    }

    #[test]
    fn test_global_trips_after_ten_server_errors_across_tenants() {
        let (registry, _) = registry();
        for i in 0..10 {
            registry.record_failure(&format!("tenant-{}", i), FailureKind::ServerError);
        }

        let decision = registry.check("fresh", "explain");
        assert!(!decision.allowed);
        assert_eq!(decision.scope, Some(CircuitScope::Global));
        assert_eq!(decision.retry_after_ms, Some(600_000));

        // No tenant reached its own threshold
        let report = registry.status(None);
        assert!(report.tenants.iter().all(|t| !t.is_open));
        assert!(report.global.is_open);
        assert_eq!(report.tracked_tenants, 10);
    }

    #[test]
    fn test_rate_limits_stay_tenant_local_by_default() {
        let (registry, _) = registry();
        for i in 0..6 {
            registry.record_failure(&format!("tenant-{}", i), FailureKind::RateLimit);
        }
        assert_eq!(registry.status(None).global.failures, 0);
        assert!(registry.check("fresh", "explain").allowed);
    }

    #[test]
    fn test_mirrored_rate_limits_trip_global() {
        let (registry, _) = registry_with(CircuitSettings {
            global_mirrored_kinds: vec![FailureKind::ServerError, FailureKind::RateLimit],
            ..CircuitSettings::default()
        });
        for i in 0..5 {
            registry.record_failure(&format!("tenant-{}", i), FailureKind::RateLimit);
        }
        let decision = registry.check("fresh", "explain");
        assert_eq!(decision.scope, Some(CircuitScope::Global));
        assert_eq!(decision.retry_after_ms, Some(300_000));
    }

    #[test]
    fn test_rate_limit_threshold_and_timeout() {
        let (registry, clock) = registry();
        registry.record_failure("acme", FailureKind::RateLimit);
        assert!(registry.check("acme", "explain").allowed);
        registry.record_failure("acme", FailureKind::RateLimit);

        let decision = registry.check("acme", "explain");
        assert_eq!(decision.retry_after_ms, Some(60_000));

        clock.advance(Duration::from_secs(60));
        assert!(registry.check("acme", "explain").allowed);
    }

    #[test]
    fn test_threshold_follows_most_recent_kind() {
        let (registry, _) = registry();
        registry.record_failure("acme", FailureKind::RateLimit);
        registry.record_failure("acme", FailureKind::ServerError);
        // Two failures, but the server error threshold is three
        assert!(registry.check("acme", "explain").allowed);

        registry.record_failure("acme", FailureKind::DataError);
        // Three failures, data error threshold is five
        assert!(registry.check("acme", "explain").allowed);

        registry.record_failure("acme", FailureKind::RateLimit);
        let decision = registry.check("acme", "explain");
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(60_000));
    }

    #[test]
    fn test_successes_drain_open_circuit() {
        let (registry, _) = registry();
        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        registry.record_success("acme");
        registry.record_success("acme");
        assert!(!registry.check("acme", "explain").allowed);

        registry.record_success("acme");
        assert!(registry.check("acme", "explain").allowed);
        assert_eq!(registry.status(Some("acme")).tenants[0].phase, PhaseLabel::Closed);
    }

    #[test]
    fn test_half_open_success_closes() {
        let (registry, clock) = registry();
        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        clock.advance(Duration::from_secs(300));
        assert!(registry.check("acme", "explain").allowed);

        registry.record_success("acme");
        let snap = registry.status(Some("acme")).tenants.remove(0);
        assert_eq!(snap.phase, PhaseLabel::Closed);
        assert_eq!(snap.half_open_attempts, 0);
    }

    #[test]
    fn test_half_open_failures_reopen_at_threshold() {
        let (registry, clock) = registry();
        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        clock.advance(Duration::from_secs(300));
        assert!(registry.check("acme", "explain").allowed);

        registry.record_failure("acme", FailureKind::ServerError);
        registry.record_failure("acme", FailureKind::ServerError);
        assert!(registry.check("acme", "explain").allowed);

        registry.record_failure("acme", FailureKind::ServerError);
        assert!(!registry.check("acme", "explain").allowed);
    }

    #[test]
    fn test_success_decays_global_counter() {
        let (registry, _) = registry();
        for i in 0..4 {
            registry.record_failure(&format!("tenant-{}", i), FailureKind::ServerError);
        }
        registry.record_success("someone-else");
        assert_eq!(registry.status(None).global.failures, 3);
    }

    #[test]
    fn test_sweep_idle_removes_only_quiet_closed_tenants() {
        let (registry, clock) = registry();
        registry.record_failure("quiet", FailureKind::DataError);
        registry.record_success("quiet");
        for _ in 0..3 {
            registry.record_failure("broken", FailureKind::ServerError);
        }

        clock.advance(Duration::from_secs(3601));
        assert_eq!(registry.sweep_idle(), 1);

        let report = registry.status(None);
        assert_eq!(report.tracked_tenants, 1);
        assert_eq!(report.tenants[0].scope, CircuitScope::tenant("broken"));
    }

    #[test]
    fn test_max_tenants_evicts_least_recently_active_closed() {
        let (registry, clock) = registry_with(CircuitSettings {
            max_tenants: 2,
            ..CircuitSettings::default()
        });

        registry.record_failure("oldest", FailureKind::DataError);
        clock.advance(Duration::from_secs(1));
        registry.record_failure("newer", FailureKind::DataError);
        clock.advance(Duration::from_secs(1));
        registry.record_failure("newest", FailureKind::DataError);

        let ids: Vec<String> = registry
            .status(None)
            .tenants
            .into_iter()
            .map(|t| t.scope.to_string())
            .collect();
        assert_eq!(ids, vec!["tenant:newer", "tenant:newest"]);
    }

    #[test]
    fn test_open_tenants_are_never_evicted() {
        let (registry, _) = registry_with(CircuitSettings {
            max_tenants: 1,
            ..CircuitSettings::default()
        });
        for _ in 0..3 {
            registry.record_failure("broken", FailureKind::ServerError);
        }
        registry.record_failure("other", FailureKind::DataError);

        assert_eq!(registry.tracked_tenants(), 2);
        assert!(!registry.check("broken", "explain").allowed);
    }

    #[test]
    fn test_transitions_are_published() {
        let (tx, mut rx) = broadcast::channel(16);
        let clock = Arc::new(ManualClock::new());
        let registry =
            CircuitBreakerRegistry::new(CircuitSettings::default(), clock.clone()).with_events(tx);

        for _ in 0..3 {
            registry.record_failure("acme", FailureKind::ServerError);
        }
        let opened = rx.try_recv().unwrap();
        assert_eq!(opened.scope, CircuitScope::tenant("acme"));
        assert_eq!(opened.to, PhaseLabel::Open);
        assert_eq!(opened.failures, 3);

        clock.advance(Duration::from_secs(300));
        registry.check("acme", "explain");
        assert_eq!(rx.try_recv().unwrap().to, PhaseLabel::HalfOpen);

        registry.record_success("acme");
        let closed = rx.try_recv().unwrap();
        assert_eq!(closed.from, PhaseLabel::HalfOpen);
        assert_eq!(closed.to, PhaseLabel::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (registry, _) = registry();
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(registry).spawn_sweeper(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
