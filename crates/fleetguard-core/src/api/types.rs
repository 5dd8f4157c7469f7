//! Public types returned by the [`FleetGuard`](super::FleetGuard) facade.

use serde::Serialize;
use thiserror::Error;

use crate::circuit::{CircuitOpenError, CircuitScope, FailureKind, PhaseLabel};
use crate::rules::{Finding, VehicleStatus};
use crate::usage::TokenUsage;

/// Errors returned by facade actions
#[derive(Debug, Error)]
pub enum GuardError {
    /// Refused locally; the inference service was never contacted
    #[error("circuit open for {scope}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        scope: CircuitScope,
        retry_after_ms: u64,
    },

    /// The inference call itself failed
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    /// No finding is a hit, so no explanation was requested
    #[error("findings do not warrant an explanation")]
    NotWarranted,

    /// The counter store rejected or timed out a write
    #[error("counter store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<CircuitOpenError> for GuardError {
    fn from(err: CircuitOpenError) -> Self {
        GuardError::CircuitOpen {
            scope: err.scope,
            retry_after_ms: err.retry_after_ms,
        }
    }
}

impl GuardError {
    /// Hint for callers deciding when to try again
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GuardError::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Failure reported by an inference call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct InferenceError {
    pub kind: FailureKind,
    pub message: String,
}

impl InferenceError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// HTTP 429 or an equivalent throttle signal
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimit, message)
    }

    /// 5xx, timeout, or connection failure
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerError, message)
    }

    /// Malformed or unusable response
    pub fn data(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DataError, message)
    }
}

/// Successful inference result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferenceOutcome {
    pub text: String,
    pub tokens: Option<TokenUsage>,
}

/// Evaluation of one snapshot with its derived views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub tenant_id: String,
    pub vehicle_id: String,
    pub status: VehicleStatus,
    pub needs_explanation: bool,
    pub most_severe: Option<Finding>,
    pub findings: Vec<Finding>,
}

/// Result of a successful `run_explanation`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explanation {
    pub assessment: Assessment,
    pub outcome: InferenceOutcome,
}

/// Overall service state for `/health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    /// Global circuit open or usage flushes failing
    Degraded,
}

/// Health summary
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub global_circuit: PhaseLabel,
    pub tracked_tenants: usize,
    pub pending_usage_entries: usize,
    pub consecutive_flush_failures: u32,
    pub shutting_down: bool,
}
