use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::responses::{component_json, health_report_json};
use crate::AppState;

pub async fn system_health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state
        .engine
        .health()
        .perform_check()
        .await
        .map_err(|e| {
            tracing::error!("health check failed: {e:#}");
            ApiError::internal("Failed to get system health")
        })?;

    Ok(Json(health_report_json(&report)))
}

pub async fn quick() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "service": "foreman-api",
    }))
}

pub async fn components(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = match state.engine.health().last_report() {
        Some(report) => report,
        None => state.engine.health().perform_check().await.map_err(|e| {
            tracing::error!("health check failed: {e:#}");
            ApiError::internal("Failed to get component health")
        })?,
    };

    Ok(Json(json!({
        "components": report.components.iter().map(component_json).collect::<Vec<_>>(),
        "last_check": report.timestamp,
    })))
}
