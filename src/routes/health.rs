use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use crate::services::queue::QueueStats;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: QueueStats,
    pub backends: Vec<CircuitBreakerSnapshot>,
}

/// GET /health: admission load and backend circuit status.
///
/// Degraded (503) while any backend circuit is open.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let queue = state.admission.stats();
    let backends = state.breakers.snapshot();

    let all_healthy = backends.iter().all(|b| b.state != CircuitState::Open);
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { queue, backends },
    };

    (status_code, Json(response))
}
