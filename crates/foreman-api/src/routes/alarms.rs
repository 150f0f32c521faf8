use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::requests::AlarmAcknowledgmentRequest;
use crate::responses::AlarmResponse;
use crate::AppState;

pub async fn active(State(state): State<AppState>) -> Result<Json<Vec<AlarmResponse>>, ApiError> {
    let alarms = state.engine.alarms().active_alarms().await.map_err(|e| {
        tracing::error!("failed to fetch active alarms: {e}");
        ApiError::internal("Failed to get alarms")
    })?;

    Ok(Json(alarms.into_iter().map(AlarmResponse::from).collect()))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(alarm_id): Path<i32>,
    Json(request): Json<AlarmAcknowledgmentRequest>,
) -> Result<Json<Value>, ApiError> {
    let acknowledged = state
        .engine
        .alarms()
        .acknowledge(alarm_id, &request.acknowledged_by)
        .await
        .map_err(|e| {
            tracing::error!(alarm_id, "failed to acknowledge alarm: {e}");
            ApiError::internal("Failed to acknowledge alarm")
        })?;

    if !acknowledged {
        return Err(ApiError::not_found("Alarm not found"));
    }

    Ok(Json(json!({ "alarm_id": alarm_id, "status": "acknowledged" })))
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(alarm_id): Path<i32>,
    Json(request): Json<AlarmAcknowledgmentRequest>,
) -> Result<Json<Value>, ApiError> {
    let resolved = state.engine.alarms().resolve(alarm_id).await.map_err(|e| {
        tracing::error!(alarm_id, "failed to resolve alarm: {e}");
        ApiError::internal("Failed to resolve alarm")
    })?;

    if !resolved {
        return Err(ApiError::not_found("Alarm not found"));
    }

    tracing::info!(alarm_id, resolved_by = %request.acknowledged_by, "alarm resolved via api");
    Ok(Json(json!({ "alarm_id": alarm_id, "status": "resolved" })))
}
