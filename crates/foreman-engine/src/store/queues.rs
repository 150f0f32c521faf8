//! Queue repository.

use foreman_core::model::{Queue, QueuePriority};
use sqlx::PgExecutor;

/// Fields for creating a queue. Missing values fall back to the column
/// defaults.
#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub description: Option<String>,
    pub priority: QueuePriority,
    pub max_workers: i32,
    pub retry_limit: i32,
    pub timeout_seconds: i32,
}

impl NewQueue {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: QueuePriority::Normal,
            max_workers: 4,
            retry_limit: 3,
            timeout_seconds: 300,
        }
    }
}

/// Partial update applied over the existing row.
#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub description: Option<String>,
    pub priority: Option<QueuePriority>,
    pub is_active: Option<bool>,
    pub max_workers: Option<i32>,
    pub retry_limit: Option<i32>,
    pub timeout_seconds: Option<i32>,
}

pub async fn by_name(db: impl PgExecutor<'_>, name: &str) -> sqlx::Result<Option<Queue>> {
    sqlx::query_as::<_, Queue>("SELECT * FROM queues WHERE name = $1")
        .bind(name)
        .fetch_optional(db)
        .await
}

pub async fn active_all(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<Queue>> {
    sqlx::query_as::<_, Queue>("SELECT * FROM queues WHERE is_active ORDER BY name")
        .fetch_all(db)
        .await
}

pub async fn all(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<Queue>> {
    sqlx::query_as::<_, Queue>("SELECT * FROM queues ORDER BY name")
        .fetch_all(db)
        .await
}

pub async fn count(db: impl PgExecutor<'_>) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queues")
        .fetch_one(db)
        .await
}

pub async fn counts(db: impl PgExecutor<'_>) -> sqlx::Result<(i64, i64)> {
    sqlx::query_as::<_, (i64, i64)>(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_active) FROM queues",
    )
    .fetch_one(db)
    .await
}

pub async fn create(db: impl PgExecutor<'_>, queue: &NewQueue) -> sqlx::Result<Queue> {
    sqlx::query_as::<_, Queue>(
        "INSERT INTO queues (name, description, priority, max_workers, retry_limit, timeout_seconds)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(&queue.name)
    .bind(&queue.description)
    .bind(queue.priority)
    .bind(queue.max_workers)
    .bind(queue.retry_limit)
    .bind(queue.timeout_seconds)
    .fetch_one(db)
    .await
}

/// Create the queue unless a queue with the same name already exists.
/// Returns the row that ends up in the table either way.
pub async fn create_if_absent(db: impl PgExecutor<'_> + Copy, queue: &NewQueue) -> sqlx::Result<Queue> {
    let inserted = sqlx::query_as::<_, Queue>(
        "INSERT INTO queues (name, description, priority, max_workers, retry_limit, timeout_seconds)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (name) DO NOTHING
         RETURNING *",
    )
    .bind(&queue.name)
    .bind(&queue.description)
    .bind(queue.priority)
    .bind(queue.max_workers)
    .bind(queue.retry_limit)
    .bind(queue.timeout_seconds)
    .fetch_optional(db)
    .await?;

    match inserted {
        Some(queue) => Ok(queue),
        None => {
            let existing = by_name(db, &queue.name).await?;
            existing.ok_or(sqlx::Error::RowNotFound)
        }
    }
}

pub async fn update(
    db: impl PgExecutor<'_>,
    name: &str,
    update: &QueueUpdate,
) -> sqlx::Result<Option<Queue>> {
    sqlx::query_as::<_, Queue>(
        "UPDATE queues
            SET description = COALESCE($2, description),
                priority = COALESCE($3, priority),
                is_active = COALESCE($4, is_active),
                max_workers = COALESCE($5, max_workers),
                retry_limit = COALESCE($6, retry_limit),
                timeout_seconds = COALESCE($7, timeout_seconds),
                updated_at = CURRENT_TIMESTAMP
          WHERE name = $1
          RETURNING *",
    )
    .bind(name)
    .bind(&update.description)
    .bind(update.priority)
    .bind(update.is_active)
    .bind(update.max_workers)
    .bind(update.retry_limit)
    .bind(update.timeout_seconds)
    .fetch_optional(db)
    .await
}
