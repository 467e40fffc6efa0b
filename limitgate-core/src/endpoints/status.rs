use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};

use crate::db::HealthCheckable;
use crate::utils::gateway::AppState;

/// A handler for a health check that reflects coordination store
/// availability: a node that cannot reach the store cannot admit anything.
pub async fn health_handler(
    State(state): AppState,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.coordination.health().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
        }))),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "coordination": "error",
            })),
        )),
    }
}
