//! Health endpoints: liveness, readiness, overall, and the full fleet
//! snapshot.

use axum::extract::State;
use axum::http::StatusCode;

use outpost_core::health::HealthStatus;

use super::envelope::{ApiResult, ok};
use super::AppState;

/// Liveness: the process is up.
pub async fn live(State(_state): State<AppState>) -> ApiResult {
    Ok(ok(StatusCode::OK, serde_json::json!({ "status": "alive" })))
}

/// Readiness: the store answers.
pub async fn ready(State(state): State<AppState>) -> ApiResult {
    let probe: Result<(i32,), sqlx::Error> = sqlx::query_as("SELECT 1")
        .fetch_one(state.store.pool())
        .await;

    match probe {
        Ok(_) => Ok(ok(StatusCode::OK, serde_json::json!({ "status": "ready" }))),
        Err(err) => {
            tracing::warn!(error = %err, "readiness probe failed");
            Ok(ok(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "status": "not_ready" }),
            ))
        }
    }
}

/// Overall health: condensed snapshot, 503 when unhealthy.
pub async fn overall(State(state): State<AppState>) -> ApiResult {
    let snapshot = state.health.snapshot().await?;
    let code = status_code(snapshot.status);
    Ok(ok(
        code,
        serde_json::json!({
            "status": snapshot.status,
            "uptime_seconds": snapshot.uptime_seconds,
            "timestamp": snapshot.timestamp,
        }),
    ))
}

/// The full fleet snapshot.
pub async fn fleet(State(state): State<AppState>) -> ApiResult {
    let snapshot = state.health.snapshot().await?;
    let code = status_code(snapshot.status);
    Ok(ok(code, snapshot))
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}
