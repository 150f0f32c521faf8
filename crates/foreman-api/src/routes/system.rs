use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::requests::EmergencyShutdownRequest;
use crate::AppState;

fn verify_shutdown_token(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Authorization header required"))?;

    let token = authorization.strip_prefix("Bearer ").unwrap_or(authorization);

    if token != expected {
        return Err(ApiError::forbidden("Invalid shutdown token"));
    }

    Ok(())
}

pub async fn shutdown(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmergencyShutdownRequest>,
) -> Result<Json<Value>, ApiError> {
    verify_shutdown_token(&headers, &state.engine.config().api.shutdown_token)?;

    tracing::warn!(
        reason = %request.reason,
        initiated_by = %request.initiated_by,
        force = request.force,
        "emergency shutdown requested via api"
    );

    state
        .engine
        .shutdown()
        .trigger(&format!(
            "API shutdown request by {}: {}",
            request.initiated_by, request.reason
        ))
        .await;

    Ok(Json(json!({
        "status": "shutdown_initiated",
        "reason": request.reason,
        "initiated_by": request.initiated_by,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.engine.system_status().await.map_err(|e| {
        tracing::error!("failed to read system status: {e}");
        ApiError::internal("Failed to get system status")
    })?;

    let Some(status) = status else {
        return Ok(Json(json!({
            "status": "unknown",
            "message": "System status not initialized",
        })));
    };

    Ok(Json(json!({
        "is_operational": status.is_operational,
        "is_maintenance_mode": status.is_maintenance_mode,
        "shutdown_requested": status.shutdown_requested,
        "shutdown_reason": status.shutdown_reason,
        "overall_health": status.overall_health.as_str(),
        "queue_health": status.queue_health.as_str(),
        "database_health": status.database_health.as_str(),
        "broker_health": status.broker_health.as_str(),
        "last_updated": status.last_updated,
        "last_health_check": status.last_health_check,
        "uptime_started": status.uptime_started,
        "version": status.version,
        "environment": status.environment,
    })))
}

pub async fn test_alarm(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if !state.engine.config().debug {
        return Err(ApiError::forbidden(
            "Test endpoints only available in debug mode",
        ));
    }

    let event = AlarmEvent::new(
        AlarmType::SystemError,
        AlarmSeverity::Warning,
        "Test Alarm",
        "This is a test alarm triggered via API",
    )
    .for_component("api_test")
    .with_context(json!({ "test": true, "timestamp": Utc::now().to_rfc3339() }));

    state.engine.alarms().trigger(event).await.map_err(|e| {
        tracing::error!("failed to trigger test alarm: {e}");
        ApiError::internal("Failed to trigger test alarm")
    })?;

    Ok(Json(json!({ "status": "test_alarm_triggered" })))
}
