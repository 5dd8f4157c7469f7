//! Rule evaluation types: severity levels, finding kinds, findings, and metric snapshots.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Severity level for a finding
///
/// Ordered so that `Crit` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Crit,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Crit => write!(f, "crit"),
        }
    }
}

/// What a finding is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Brake pad wear percentage
    BrakeWear,
    /// Fuel efficiency against baseline or absolute floor
    FuelEfficiency,
    /// Harsh braking/acceleration/cornering events
    HarshEvents,
    /// Engine idle time
    IdleTime,
    /// Days since last service
    MaintenanceOverdue,
    /// Telemetry completeness
    DataQuality,
    /// Synthetic "nothing wrong" result
    NormalOperation,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingKind::BrakeWear => write!(f, "brake-wear"),
            FindingKind::FuelEfficiency => write!(f, "fuel-efficiency"),
            FindingKind::HarshEvents => write!(f, "harsh-events"),
            FindingKind::IdleTime => write!(f, "idle-time"),
            FindingKind::MaintenanceOverdue => write!(f, "maintenance-overdue"),
            FindingKind::DataQuality => write!(f, "data-quality"),
            FindingKind::NormalOperation => write!(f, "normal-operation"),
        }
    }
}

/// The metric observation behind a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Snapshot field the value came from
    pub metric: String,
    /// Observed value
    pub observed: f64,
    /// Threshold that was crossed (if any)
    pub threshold: Option<f64>,
    /// Evaluation window label (e.g. "last 7 days")
    pub period: Option<String>,
}

impl Evidence {
    pub(crate) fn new(metric: &str, observed: f64, threshold: Option<f64>) -> Self {
        Self {
            metric: metric.to_string(),
            observed,
            threshold,
            period: None,
        }
    }

    pub(crate) fn with_period(mut self, period: Option<&str>) -> Self {
        self.period = period.map(str::to_string);
        self
    }
}

/// A single rule evaluation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Whether this counts as a safety/maintenance hit
    pub hit: bool,
    /// Human-readable explanation
    pub reason: String,
    /// Absent only for the synthetic normal-operation finding
    pub evidence: Option<Evidence>,
}

impl Finding {
    pub(crate) fn hit(
        kind: FindingKind,
        severity: Severity,
        reason: String,
        evidence: Evidence,
    ) -> Self {
        Self {
            kind,
            severity,
            hit: true,
            reason,
            evidence: Some(evidence),
        }
    }

    /// Whether this is a warn/crit hit
    pub fn is_actionable(&self) -> bool {
        self.hit && self.severity >= Severity::Warn
    }
}

/// Derived vehicle status over a finding list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Healthy,
    Warning,
    Flagged,
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleStatus::Healthy => write!(f, "healthy"),
            VehicleStatus::Warning => write!(f, "warning"),
            VehicleStatus::Flagged => write!(f, "flagged"),
        }
    }
}

/// Point-in-time telemetry for one vehicle
///
/// Every metric is optional; rules whose input is absent are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub tenant_id: String,
    pub vehicle_id: String,
    /// Brake pad wear (0-100)
    #[serde(default)]
    pub brake_wear_pct: Option<f64>,
    /// Observed fuel efficiency (distance per volume)
    #[serde(default)]
    pub fuel_efficiency: Option<f64>,
    /// Expected fuel efficiency for this vehicle
    #[serde(default)]
    pub fuel_baseline: Option<f64>,
    /// Harsh events within the evaluation window
    #[serde(default)]
    pub harsh_events: Option<u32>,
    /// Idle minutes within the evaluation window
    #[serde(default)]
    pub idle_minutes: Option<f64>,
    #[serde(default)]
    pub last_service_date: Option<NaiveDate>,
    /// Share of expected telemetry actually received (0-100)
    #[serde(default)]
    pub data_completeness_pct: Option<f64>,
    /// Evaluation window label
    #[serde(default)]
    pub period: Option<String>,
    /// When the snapshot was taken; also "now" for overdue math
    pub timestamp: DateTime<Utc>,
}

impl MetricSnapshot {
    /// Create a snapshot with no metrics set
    pub fn new(
        tenant_id: impl Into<String>,
        vehicle_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            vehicle_id: vehicle_id.into(),
            brake_wear_pct: None,
            fuel_efficiency: None,
            fuel_baseline: None,
            harsh_events: None,
            idle_minutes: None,
            last_service_date: None,
            data_completeness_pct: None,
            period: None,
            timestamp,
        }
    }
}

/// Rule thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleThresholds {
    #[serde(default = "default_brake_warn")]
    pub brake_warn_pct: f64,
    #[serde(default = "default_brake_crit")]
    pub brake_crit_pct: f64,
    /// Percentage drop from baseline that warns
    #[serde(default = "default_fuel_drop_warn")]
    pub fuel_drop_warn_pct: f64,
    /// Percentage drop from baseline that is critical
    #[serde(default = "default_fuel_drop_crit")]
    pub fuel_drop_crit_pct: f64,
    /// Absolute efficiency below which a warning fires without a baseline
    #[serde(default = "default_fuel_floor")]
    pub fuel_floor: f64,
    #[serde(default = "default_harsh_warn")]
    pub harsh_warn: u32,
    #[serde(default = "default_harsh_crit")]
    pub harsh_crit: u32,
    #[serde(default = "default_idle_warn")]
    pub idle_warn_minutes: f64,
    #[serde(default = "default_service_warn")]
    pub service_warn_days: i64,
    #[serde(default = "default_service_crit")]
    pub service_crit_days: i64,
    /// Completeness below this degrades explanation quality
    #[serde(default = "default_completeness_floor")]
    pub completeness_floor_pct: f64,
}

fn default_brake_warn() -> f64 {
    70.0
}

fn default_brake_crit() -> f64 {
    85.0
}

fn default_fuel_drop_warn() -> f64 {
    15.0
}

fn default_fuel_drop_crit() -> f64 {
    25.0
}

fn default_fuel_floor() -> f64 {
    10.0
}

fn default_harsh_warn() -> u32 {
    3
}

fn default_harsh_crit() -> u32 {
    5
}

fn default_idle_warn() -> f64 {
    120.0
}

fn default_service_warn() -> i64 {
    90
}

fn default_service_crit() -> i64 {
    120
}

fn default_completeness_floor() -> f64 {
    60.0
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            brake_warn_pct: default_brake_warn(),
            brake_crit_pct: default_brake_crit(),
            fuel_drop_warn_pct: default_fuel_drop_warn(),
            fuel_drop_crit_pct: default_fuel_drop_crit(),
            fuel_floor: default_fuel_floor(),
            harsh_warn: default_harsh_warn(),
            harsh_crit: default_harsh_crit(),
            idle_warn_minutes: default_idle_warn(),
            service_warn_days: default_service_warn(),
            service_crit_days: default_service_crit(),
            completeness_floor_pct: default_completeness_floor(),
        }
    }
}
