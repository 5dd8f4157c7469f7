//! Circuit breaker types: failure kinds, scopes, phases, decisions, and status snapshots.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of failure reported by a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The inference service throttled the request (HTTP 429)
    RateLimit,
    /// The inference service failed (5xx, timeout, connection reset)
    ServerError,
    /// The response was malformed or unusable
    DataError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::RateLimit => write!(f, "rate_limit"),
            FailureKind::ServerError => write!(f, "server_error"),
            FailureKind::DataError => write!(f, "data_error"),
        }
    }
}

/// Which circuit a state belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "tenant_id", rename_all = "snake_case")]
pub enum CircuitScope {
    /// Shared circuit that gates every tenant
    Global,
    /// Per-tenant circuit
    Tenant(String),
}

impl CircuitScope {
    pub fn tenant(id: impl Into<String>) -> Self {
        CircuitScope::Tenant(id.into())
    }
}

impl fmt::Display for CircuitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitScope::Global => write!(f, "global"),
            CircuitScope::Tenant(id) => write!(f, "tenant:{}", id),
        }
    }
}

/// Internal phase of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    /// Calls allowed, failures tracked
    Closed,
    /// Calls rejected until the timeout elapses
    Open { since: Instant },
    /// Timeout elapsed and a probe was let through; the next report decides
    HalfOpen,
}

impl CircuitPhase {
    pub fn label(&self) -> PhaseLabel {
        match self {
            CircuitPhase::Closed => PhaseLabel::Closed,
            CircuitPhase::Open { .. } => PhaseLabel::Open,
            CircuitPhase::HalfOpen => PhaseLabel::HalfOpen,
        }
    }
}

/// Serializable phase name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseLabel {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseLabel::Closed => write!(f, "closed"),
            PhaseLabel::Open => write!(f, "open"),
            PhaseLabel::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Mutable failure state for one scope
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub last_failure_kind: Option<FailureKind>,
    pub half_open_attempts: u32,
    pub phase: CircuitPhase,
    /// Last check/report touching this scope (drives idle eviction)
    pub last_activity: Instant,
}

impl CircuitState {
    pub fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            last_failure: None,
            last_failure_kind: None,
            half_open_attempts: 0,
            phase: CircuitPhase::Closed,
            last_activity: now,
        }
    }

    /// Nothing worth remembering: closed-ish and no outstanding failures
    pub fn is_quiescent(&self) -> bool {
        self.failures == 0 && !matches!(self.phase, CircuitPhase::Open { .. })
    }

    /// Time left before an open circuit may admit a probe
    ///
    /// `None` unless the phase is Open and `timeout` has not elapsed since
    /// the most recent failure.
    pub fn open_remaining(&self, timeout: Duration, now: Instant) -> Option<Duration> {
        let CircuitPhase::Open { since } = self.phase else {
            return None;
        };
        let anchor = self.last_failure.unwrap_or(since);
        let elapsed = now.saturating_duration_since(anchor);
        (elapsed < timeout).then(|| timeout - elapsed)
    }

    /// Open and still within `timeout`
    pub fn is_open(&self, timeout: Duration, now: Instant) -> bool {
        self.open_remaining(timeout, now).is_some()
    }
}

/// Outcome of a circuit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitDecision {
    pub allowed: bool,
    /// Why the call was rejected
    pub reason: Option<String>,
    /// How long until the rejecting circuit may admit a probe
    pub retry_after_ms: Option<u64>,
    /// The circuit that rejected the call
    pub scope: Option<CircuitScope>,
}

impl CircuitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
            scope: None,
        }
    }

    pub fn reject(scope: CircuitScope, reason: String, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_ms: Some(retry_after_ms),
            scope: Some(scope),
        }
    }

    /// Convert a rejection into a local error carrying the retry hint
    pub fn into_result(self) -> Result<(), CircuitOpenError> {
        if self.allowed {
            return Ok(());
        }
        Err(CircuitOpenError {
            scope: self.scope.unwrap_or(CircuitScope::Global),
            retry_after_ms: self.retry_after_ms.unwrap_or(0),
        })
    }
}

/// A call was refused locally because a circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for {scope}; retry after {retry_after_ms}ms")]
pub struct CircuitOpenError {
    pub scope: CircuitScope,
    pub retry_after_ms: u64,
}

/// A circuit changed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitTransition {
    pub scope: CircuitScope,
    pub from: PhaseLabel,
    pub to: PhaseLabel,
    pub failures: u32,
    pub failure_kind: Option<FailureKind>,
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub scope: CircuitScope,
    pub phase: PhaseLabel,
    /// Open and still within its timeout
    pub is_open: bool,
    pub failures: u32,
    pub last_failure_kind: Option<FailureKind>,
    pub last_failure_ago_ms: Option<u64>,
    pub half_open_attempts: u32,
    pub retry_after_ms: Option<u64>,
}

/// Status of the global circuit plus the requested tenant circuits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatusReport {
    pub global: CircuitSnapshot,
    pub tenants: Vec<CircuitSnapshot>,
    /// Tenants currently held in memory
    pub tracked_tenants: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        assert_eq!(format!("{}", CircuitScope::Global), "global");
        assert_eq!(format!("{}", CircuitScope::tenant("acme")), "tenant:acme");
    }

    #[test]
    fn test_failure_kind_serde() {
        let kind: FailureKind = serde_json::from_str("\"rate_limit\"").unwrap();
        assert_eq!(kind, FailureKind::RateLimit);
        assert_eq!(
            serde_json::to_string(&FailureKind::ServerError).unwrap(),
            "\"server_error\""
        );
    }

    #[test]
    fn test_decision_into_result() {
        assert!(CircuitDecision::allow().into_result().is_ok());

        let err = CircuitDecision::reject(CircuitScope::tenant("t1"), "open".to_string(), 1500)
            .into_result()
            .unwrap_err();
        assert_eq!(err.retry_after_ms, 1500);
        assert_eq!(err.to_string(), "circuit open for tenant:t1; retry after 1500ms");
    }

    #[test]
    fn test_quiescent() {
        let now = Instant::now();
        let mut state = CircuitState::new(now);
        assert!(state.is_quiescent());
        state.failures = 1;
        assert!(!state.is_quiescent());
        state.failures = 0;
        state.phase = CircuitPhase::Open { since: now };
        assert!(!state.is_quiescent());
    }

    #[test]
    fn test_open_remaining_measured_from_last_failure() {
        let start = Instant::now();
        let mut state = CircuitState::new(start);
        let timeout = Duration::from_secs(60);
        assert!(!state.is_open(timeout, start));

        state.phase = CircuitPhase::Open { since: start };
        state.last_failure = Some(start + Duration::from_secs(10));

        let at = start + Duration::from_secs(30);
        assert_eq!(state.open_remaining(timeout, at), Some(Duration::from_secs(40)));
        assert!(!state.is_open(timeout, start + Duration::from_secs(70)));
    }
}
