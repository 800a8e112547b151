use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, error};

use crate::api::AppState;
use crate::health::{HealthState, HealthStatus};

/// GET /health
///
/// 503 only when the ledger is unreachable; a degraded cache or an open
/// gateway circuit still answers 200 with the details.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let status = state.health.check_health().await;
    let code = if matches!(status.status, HealthState::Unhealthy) {
        error!("health check failed, service unhealthy");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        debug!(status = ?status.status, "health check passed");
        StatusCode::OK
    };
    (code, Json(status))
}

/// GET /health/ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let status = state.health.check_health().await;
    if status.is_ready() {
        (StatusCode::OK, Json(status))
    } else {
        error!("readiness check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

/// GET /health/live
pub async fn liveness() -> &'static str {
    "OK"
}
