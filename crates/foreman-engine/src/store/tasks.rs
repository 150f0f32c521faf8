//! Task repository, including the guarded lifecycle transition writes.
//!
//! Transition updates carry their legal source states in the WHERE clause
//! so that re-running one is a no-op instead of a duplicate stamp: a task
//! can never leave a terminal state and `started_at`/`completed_at` are
//! only ever written once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use foreman_core::model::{QueuePriority, Task, TaskStatus};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgExecutor, Postgres, QueryBuilder};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Uuid,
    pub queue_id: i32,
    pub task_type: String,
    pub task_name: String,
    pub payload: Value,
    pub priority: QueuePriority,
    pub max_retries: i32,
    pub correlation_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub worker_id: String,
    pub tags: Option<HashMap<String, String>>,
}

/// Per-queue task counts grouped by status, in one round-trip.
#[derive(Debug, Clone, Copy, Default, sqlx::FromRow)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Filters for the task listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub queue_id: Option<i32>,
    pub correlation_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn insert(db: impl PgExecutor<'_>, task: &NewTask) -> sqlx::Result<Task> {
    sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (
            id, queue_id, task_type, task_name, payload, status, priority,
            max_retries, correlation_id, scheduled_at, timeout_at, worker_id, tags
        )
        VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9, $10, $11, $12)
        RETURNING *",
    )
    .bind(task.id)
    .bind(task.queue_id)
    .bind(&task.task_type)
    .bind(&task.task_name)
    .bind(&task.payload)
    .bind(task.priority)
    .bind(task.max_retries)
    .bind(&task.correlation_id)
    .bind(task.scheduled_at)
    .bind(task.timeout_at)
    .bind(&task.worker_id)
    .bind(task.tags.as_ref().map(Json))
    .fetch_one(db)
    .await
}

pub async fn by_id(db: impl PgExecutor<'_>, id: Uuid) -> sqlx::Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Look up a task by the broker-assigned execution id.
pub async fn by_worker_id(db: impl PgExecutor<'_>, worker_id: &str) -> sqlx::Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE worker_id = $1")
        .bind(worker_id)
        .fetch_optional(db)
        .await
}

pub async fn by_status(
    db: impl PgExecutor<'_>,
    status: TaskStatus,
    limit: i64,
) -> sqlx::Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(status)
    .bind(limit)
    .fetch_all(db)
    .await
}

/// Tasks stuck in `processing` past their timeout deadline.
pub async fn overdue_processing(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks
          WHERE status = 'processing' AND timeout_at < CURRENT_TIMESTAMP
          ORDER BY timeout_at",
    )
    .fetch_all(db)
    .await
}

pub async fn overdue_count(db: impl PgExecutor<'_>, queue_id: i32) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM tasks
          WHERE queue_id = $1 AND status = 'processing' AND timeout_at < CURRENT_TIMESTAMP",
    )
    .bind(queue_id)
    .fetch_one(db)
    .await
}

pub async fn queue_stats(db: impl PgExecutor<'_>, queue_id: i32) -> sqlx::Result<QueueStats> {
    sqlx::query_as::<_, QueueStats>(
        "SELECT COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
           FROM tasks
          WHERE queue_id = $1",
    )
    .bind(queue_id)
    .fetch_one(db)
    .await
}

pub async fn last_completed_at(
    db: impl PgExecutor<'_>,
    queue_id: i32,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MAX(completed_at) FROM tasks
          WHERE queue_id = $1 AND status = 'completed'",
    )
    .bind(queue_id)
    .fetch_one(db)
    .await
}

/// Average/min/max processing seconds over completed tasks of a queue.
pub async fn processing_time_stats(
    db: impl PgExecutor<'_>,
    queue_id: i32,
) -> sqlx::Result<(Option<f64>, Option<f64>, Option<f64>)> {
    sqlx::query_as::<_, (Option<f64>, Option<f64>, Option<f64>)>(
        "SELECT AVG(EXTRACT(EPOCH FROM completed_at - started_at))::float8,
                MIN(EXTRACT(EPOCH FROM completed_at - started_at))::float8,
                MAX(EXTRACT(EPOCH FROM completed_at - started_at))::float8
           FROM tasks
          WHERE queue_id = $1
            AND status = 'completed'
            AND started_at IS NOT NULL
            AND completed_at IS NOT NULL",
    )
    .bind(queue_id)
    .fetch_one(db)
    .await
}

pub async fn list(db: impl PgExecutor<'_>, filter: &TaskFilter) -> sqlx::Result<Vec<Task>> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM tasks WHERE TRUE");

    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status);
    }
    if let Some(task_type) = &filter.task_type {
        builder.push(" AND task_type = ").push_bind(task_type.clone());
    }
    if let Some(queue_id) = filter.queue_id {
        builder.push(" AND queue_id = ").push_bind(queue_id);
    }
    if let Some(correlation_id) = &filter.correlation_id {
        builder
            .push(" AND correlation_id = ")
            .push_bind(correlation_id.clone());
    }

    builder
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(filter.limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(filter.offset.max(0));

    builder.build_query_as::<Task>().fetch_all(db).await
}

/// pending/retrying -> processing. Stamps `started_at` only on the first
/// entry into processing.
pub async fn mark_processing(db: impl PgExecutor<'_>, id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks
            SET status = 'processing',
                started_at = COALESCE(started_at, CURRENT_TIMESTAMP)
          WHERE id = $1 AND status IN ('pending', 'retrying')",
    )
    .bind(id)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// processing -> completed.
pub async fn mark_completed(
    db: impl PgExecutor<'_>,
    id: Uuid,
    result: &Value,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        "UPDATE tasks
            SET status = 'completed',
                completed_at = COALESCE(completed_at, CURRENT_TIMESTAMP),
                result = $2
          WHERE id = $1 AND status = 'processing'",
    )
    .bind(id)
    .bind(result)
    .execute(db)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// processing -> retrying, bumping `retry_count` while it is still below
/// the bound. Returns the new count when the transition applied.
pub async fn mark_retrying(
    db: impl PgExecutor<'_>,
    id: Uuid,
    error_message: &str,
    error_traceback: &str,
) -> sqlx::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        "UPDATE tasks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                last_error_at = CURRENT_TIMESTAMP,
                error_message = $2,
                error_traceback = $3
          WHERE id = $1 AND status = 'processing' AND retry_count < max_retries
          RETURNING retry_count",
    )
    .bind(id)
    .bind(error_message)
    .bind(error_traceback)
    .fetch_optional(db)
    .await
}

/// processing/retrying -> failed.
pub async fn mark_failed(
    db: impl PgExecutor<'_>,
    id: Uuid,
    error_message: &str,
    error_traceback: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks
            SET status = 'failed',
                completed_at = COALESCE(completed_at, CURRENT_TIMESTAMP),
                error_message = $2,
                error_traceback = $3
          WHERE id = $1 AND status IN ('processing', 'retrying')",
    )
    .bind(id)
    .bind(error_message)
    .bind(error_traceback)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Any non-terminal state -> cancelled.
pub async fn cancel(db: impl PgExecutor<'_>, id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks
            SET status = 'cancelled',
                completed_at = COALESCE(completed_at, CURRENT_TIMESTAMP)
          WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}
