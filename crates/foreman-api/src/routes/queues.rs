use axum::extract::{Path, State};
use axum::Json;
use foreman_core::model::Queue;
use foreman_engine::{NewQueue, QueueUpdate};

use crate::error::ApiError;
use crate::requests::{QueueCreateRequest, QueueUpdateRequest};
use crate::responses::QueueHealthResponse;
use crate::AppState;

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Queue>>, ApiError> {
    let queues = state.engine.manager().list_queues().await.map_err(|e| {
        tracing::error!("failed to list queues: {e}");
        ApiError::internal("Failed to list queues")
    })?;

    Ok(Json(queues))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<QueueCreateRequest>,
) -> Result<Json<Queue>, ApiError> {
    request.validate().map_err(ApiError::unprocessable)?;

    let queue = state
        .engine
        .manager()
        .create_queue(NewQueue {
            name: request.name,
            description: request.description,
            priority: request.priority,
            max_workers: request.max_workers,
            retry_limit: request.retry_limit,
            timeout_seconds: request.timeout_seconds,
        })
        .await?;

    Ok(Json(queue))
}

pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<QueueUpdateRequest>,
) -> Result<Json<Queue>, ApiError> {
    request.validate().map_err(ApiError::unprocessable)?;

    let queue = state
        .engine
        .manager()
        .update_queue(
            &name,
            QueueUpdate {
                description: request.description,
                priority: request.priority,
                is_active: request.is_active,
                max_workers: request.max_workers,
                retry_limit: request.retry_limit,
                timeout_seconds: request.timeout_seconds,
            },
        )
        .await?;

    Ok(Json(queue))
}

pub async fn health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueHealthResponse>, ApiError> {
    let health = state.engine.manager().queue_health(&name).await.map_err(|e| {
        tracing::error!(queue = %name, "failed to get queue health: {e}");
        ApiError::internal(format!("Failed to get queue health: {e}"))
    })?;

    Ok(Json(health.into()))
}
