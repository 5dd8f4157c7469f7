//! RuleEvaluator: runs every metric check and derives status views.

use super::checks;
use super::types::{Finding, FindingKind, MetricSnapshot, RuleThresholds, Severity, VehicleStatus};

/// Evaluates metric snapshots against a set of thresholds
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluator {
    thresholds: RuleThresholds,
}

impl RuleEvaluator {
    /// Create an evaluator with custom thresholds
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in use
    pub fn thresholds(&self) -> &RuleThresholds {
        &self.thresholds
    }

    /// Evaluate a snapshot into an ordered list of findings.
    ///
    /// Deterministic and total. When no rule produces a hit and data
    /// completeness is adequate (or unreported), the result is a single
    /// `normal_operation` info finding, so an empty list never means
    /// "nothing wrong".
    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> Vec<Finding> {
        let mut findings = Vec::new();
        checks::check_all_rules(snapshot, &self.thresholds, &mut findings);

        let any_hit = findings.iter().any(|f| f.hit);
        let quality_degraded = findings.iter().any(|f| f.kind == FindingKind::DataQuality);

        if !any_hit && !quality_degraded {
            findings.push(Finding {
                kind: FindingKind::NormalOperation,
                severity: Severity::Info,
                hit: false,
                reason: format!(
                    "Vehicle {} is operating within normal parameters",
                    snapshot.vehicle_id
                ),
                evidence: None,
            });
        }

        findings
    }
}

/// Evaluate with default thresholds
pub fn evaluate(snapshot: &MetricSnapshot) -> Vec<Finding> {
    RuleEvaluator::default().evaluate(snapshot)
}

/// Pick the single most severe finding.
///
/// Order is `crit > warn > info`; among equal severities the earliest
/// finding in evaluation order wins.
pub fn most_severe(findings: &[Finding]) -> Option<&Finding> {
    findings.iter().fold(None, |best: Option<&Finding>, f| match best {
        Some(b) if b.severity >= f.severity => Some(b),
        _ => Some(f),
    })
}

/// Classify a finding list into a vehicle status
pub fn classify(findings: &[Finding]) -> VehicleStatus {
    let hits = findings.iter().filter(|f| f.hit);
    match hits.map(|f| f.severity).max() {
        Some(Severity::Crit) => VehicleStatus::Flagged,
        Some(Severity::Warn) => VehicleStatus::Warning,
        _ => VehicleStatus::Healthy,
    }
}

/// Whether the findings justify an explanation request
pub fn needs_explanation(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_actionable)
}
