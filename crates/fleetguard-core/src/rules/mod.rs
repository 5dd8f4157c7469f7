//! Telemetry rule evaluation.
//!
//! Turns a vehicle's metric snapshot into severity-tagged findings. Pure:
//! no state, no I/O.

pub mod checks;
pub mod evaluator;
pub mod types;

pub use evaluator::{classify, evaluate, most_severe, needs_explanation, RuleEvaluator};
pub use types::{
    Evidence, Finding, FindingKind, MetricSnapshot, RuleThresholds, Severity, VehicleStatus,
};
