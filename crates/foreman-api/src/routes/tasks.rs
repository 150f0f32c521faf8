use axum::extract::{Path, Query, State};
use axum::Json;
use foreman_core::Error;
use foreman_engine::store::tasks::TaskFilter;
use foreman_engine::TaskSnapshot;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::requests::{TaskListQuery, TaskSubmissionRequest};
use crate::AppState;

pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<TaskSubmissionRequest>,
) -> Result<Json<Value>, ApiError> {
    request.validate().map_err(ApiError::unprocessable)?;

    let task_id = state
        .engine
        .manager()
        .submit(request.into_submission())
        .await
        .map_err(|e| {
            tracing::error!("task submission failed: {e}");
            ApiError::internal(format!("Failed to submit task: {e}"))
        })?;

    Ok(Json(json!({ "task_id": task_id, "status": "submitted" })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    match state.engine.manager().task_status(task_id).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(Error::TaskNotFound(_)) => Err(ApiError::not_found("Task not found")),
        Err(e) => {
            tracing::error!(%task_id, "failed to get task status: {e}");
            Err(ApiError::internal("Failed to get task status"))
        }
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    match state.engine.manager().cancel(task_id).await {
        Ok(()) => Ok(Json(json!({ "task_id": task_id, "status": "cancelled" }))),
        Err(Error::TaskNotFound(_)) => Err(ApiError::not_found("Task not found")),
        Err(e) => {
            tracing::error!(%task_id, "failed to cancel task: {e}");
            Err(ApiError::internal("Failed to cancel task"))
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Value>, ApiError> {
    // The filter works on queue ids; resolve the name first.
    let queue_id = match &query.queue_name {
        Some(name) => {
            let queues = state.engine.manager().list_queues().await.map_err(|e| {
                tracing::error!("failed to list queues: {e}");
                ApiError::internal("Failed to list tasks")
            })?;

            match queues.iter().find(|q| &q.name == name) {
                Some(queue) => Some(queue.id),
                None => return Err(ApiError::not_found(format!("Queue '{name}' not found"))),
            }
        }
        None => None,
    };

    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 1000);

    let filter = TaskFilter {
        status: query.status,
        task_type: query.task_type.clone(),
        queue_id,
        correlation_id: query.correlation_id.clone(),
        limit: page_size,
        offset: (page - 1) * page_size,
    };

    let tasks = state.engine.manager().list_tasks(&filter).await.map_err(|e| {
        tracing::error!("failed to list tasks: {e}");
        ApiError::internal("Failed to list tasks")
    })?;

    let count = tasks.len();
    Ok(Json(json!({
        "tasks": tasks,
        "page": page,
        "page_size": page_size,
        "count": count,
    })))
}
