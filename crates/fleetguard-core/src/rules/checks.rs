//! Individual rule check functions.
//!
//! Each function inspects one metric of a snapshot and pushes any findings
//! onto the `findings` vector. A check whose input is absent pushes nothing.

use super::types::{Evidence, Finding, FindingKind, MetricSnapshot, RuleThresholds, Severity};

// =========================================================
// Brake wear
// =========================================================

/// Brake wear: warn at `brake_warn_pct`, crit at `brake_crit_pct`
pub fn check_brake_wear(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let wear = match snapshot.brake_wear_pct {
        Some(w) => w,
        None => return,
    };

    let (severity, threshold) = if wear >= thresholds.brake_crit_pct {
        (Severity::Crit, thresholds.brake_crit_pct)
    } else if wear >= thresholds.brake_warn_pct {
        (Severity::Warn, thresholds.brake_warn_pct)
    } else {
        return;
    };

    findings.push(Finding::hit(
        FindingKind::BrakeWear,
        severity,
        format!("Brake wear at {:.0}% (threshold {:.0}%)", wear, threshold),
        Evidence::new("brake_wear_pct", wear, Some(threshold)),
    ));
}

// =========================================================
// Fuel efficiency
// =========================================================

/// Fuel efficiency: drop from baseline, then the absolute floor
///
/// The floor check only fires when the baseline check produced nothing, so a
/// snapshot yields at most one fuel-efficiency finding.
pub fn check_fuel_efficiency(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let efficiency = match snapshot.fuel_efficiency {
        Some(e) => e,
        None => return,
    };

    if let Some(baseline) = snapshot.fuel_baseline.filter(|b| *b > 0.0) {
        let drop_pct = (baseline - efficiency) / baseline * 100.0;

        let tier = if drop_pct >= thresholds.fuel_drop_crit_pct {
            Some((Severity::Crit, thresholds.fuel_drop_crit_pct))
        } else if drop_pct >= thresholds.fuel_drop_warn_pct {
            Some((Severity::Warn, thresholds.fuel_drop_warn_pct))
        } else {
            None
        };

        if let Some((severity, drop_threshold)) = tier {
            let threshold = baseline * (1.0 - drop_threshold / 100.0);
            findings.push(Finding::hit(
                FindingKind::FuelEfficiency,
                severity,
                format!(
                    "Fuel efficiency {:.1} is {:.0}% below baseline {:.1}",
                    efficiency, drop_pct, baseline
                ),
                Evidence::new("fuel_efficiency", efficiency, Some(threshold))
                    .with_period(snapshot.period.as_deref()),
            ));
            return;
        }
    }

    if efficiency < thresholds.fuel_floor {
        findings.push(Finding::hit(
            FindingKind::FuelEfficiency,
            Severity::Warn,
            format!(
                "Fuel efficiency {:.1} is below the minimum of {:.1}",
                efficiency, thresholds.fuel_floor
            ),
            Evidence::new("fuel_efficiency", efficiency, Some(thresholds.fuel_floor))
                .with_period(snapshot.period.as_deref()),
        ));
    }
}

// =========================================================
// Harsh events
// =========================================================

/// Harsh events in the window: warn at `harsh_warn`, crit at `harsh_crit`
pub fn check_harsh_events(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let count = match snapshot.harsh_events {
        Some(c) => c,
        None => return,
    };

    let (severity, threshold) = if count >= thresholds.harsh_crit {
        (Severity::Crit, thresholds.harsh_crit)
    } else if count >= thresholds.harsh_warn {
        (Severity::Warn, thresholds.harsh_warn)
    } else {
        return;
    };

    findings.push(Finding::hit(
        FindingKind::HarshEvents,
        severity,
        format!("{} harsh driving events recorded", count),
        Evidence::new("harsh_events", f64::from(count), Some(f64::from(threshold)))
            .with_period(snapshot.period.as_deref()),
    ));
}

// =========================================================
// Idle time
// =========================================================

/// Idle minutes in the window: warn at `idle_warn_minutes`
pub fn check_idle_time(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let minutes = match snapshot.idle_minutes {
        Some(m) => m,
        None => return,
    };

    if minutes >= thresholds.idle_warn_minutes {
        findings.push(Finding::hit(
            FindingKind::IdleTime,
            Severity::Warn,
            format!("Engine idled for {:.0} minutes", minutes),
            Evidence::new("idle_minutes", minutes, Some(thresholds.idle_warn_minutes))
                .with_period(snapshot.period.as_deref()),
        ));
    }
}

// =========================================================
// Maintenance overdue
// =========================================================

/// Days since last service, measured to the snapshot timestamp
pub fn check_maintenance_overdue(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let last_service = match snapshot.last_service_date {
        Some(d) => d,
        None => return,
    };

    let days = (snapshot.timestamp.date_naive() - last_service).num_days();
    // Service dated after the snapshot: nothing to measure
    if days < 0 {
        return;
    }

    let (severity, threshold) = if days >= thresholds.service_crit_days {
        (Severity::Crit, thresholds.service_crit_days)
    } else if days >= thresholds.service_warn_days {
        (Severity::Warn, thresholds.service_warn_days)
    } else {
        return;
    };

    findings.push(Finding::hit(
        FindingKind::MaintenanceOverdue,
        severity,
        format!("Last service was {} days ago (on {})", days, last_service),
        Evidence::new("last_service_date", days as f64, Some(threshold as f64)),
    ));
}

// =========================================================
// Data quality
// =========================================================

/// Completeness below the floor: an info finding that is not a hit
pub fn check_data_quality(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    let completeness = match snapshot.data_completeness_pct {
        Some(c) => c,
        None => return,
    };

    if completeness < thresholds.completeness_floor_pct {
        findings.push(Finding {
            kind: FindingKind::DataQuality,
            severity: Severity::Info,
            hit: false,
            reason: format!(
                "Telemetry is {:.0}% complete (below {:.0}%); explanations may be less reliable",
                completeness, thresholds.completeness_floor_pct
            ),
            evidence: Some(
                Evidence::new(
                    "data_completeness_pct",
                    completeness,
                    Some(thresholds.completeness_floor_pct),
                )
                .with_period(snapshot.period.as_deref()),
            ),
        });
    }
}

/// Run every metric check in evaluation order
///
/// The order is part of the contract: `most_severe` breaks ties by it.
/// 1. brake wear, 2. fuel efficiency, 3. harsh events, 4. idle time,
/// 5. maintenance overdue, 6. data quality.
pub fn check_all_rules(
    snapshot: &MetricSnapshot,
    thresholds: &RuleThresholds,
    findings: &mut Vec<Finding>,
) {
    check_brake_wear(snapshot, thresholds, findings);
    check_fuel_efficiency(snapshot, thresholds, findings);
    check_harsh_events(snapshot, thresholds, findings);
    check_idle_time(snapshot, thresholds, findings);
    check_maintenance_overdue(snapshot, thresholds, findings);
    check_data_quality(snapshot, thresholds, findings);
}
