//! REST API handlers for guard status and ad-hoc evaluation

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use std::sync::Arc;

use fleetguard_core::api::{Assessment, FleetGuard, HealthReport};
use fleetguard_core::circuit::CircuitStatusReport;
use fleetguard_core::rules::MetricSnapshot;
use fleetguard_core::usage::UsageStatus;

/// Helper to create JSON error responses
fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({"error": message})))
}

/// Shared state for API handlers
pub struct ApiState {
    pub guard: Arc<FleetGuard>,
}

/// GET /health
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthReport> {
    Json(state.guard.health())
}

/// GET /api/circuits
pub async fn get_circuits(State(state): State<Arc<ApiState>>) -> Json<CircuitStatusReport> {
    Json(state.guard.circuit_status(None))
}

/// GET /api/circuits/{tenant}
pub async fn get_tenant_circuit(
    State(state): State<Arc<ApiState>>,
    Path(tenant): Path<String>,
) -> Json<CircuitStatusReport> {
    Json(state.guard.circuit_status(Some(&tenant)))
}

/// GET /api/usage
pub async fn get_usage(State(state): State<Arc<ApiState>>) -> Json<UsageStatus> {
    Json(state.guard.usage_status())
}

/// POST /api/evaluate
pub async fn evaluate(
    State(state): State<Arc<ApiState>>,
    Json(snapshot): Json<MetricSnapshot>,
) -> Result<Json<Assessment>, (StatusCode, Json<serde_json::Value>)> {
    if snapshot.tenant_id.trim().is_empty() || snapshot.vehicle_id.trim().is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "tenant_id and vehicle_id are required",
        ));
    }
    Ok(Json(state.guard.assess(&snapshot)))
}
