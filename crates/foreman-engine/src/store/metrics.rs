//! Queue metrics samples, appended once per health tick.

use foreman_core::model::QueueMetrics;
use sqlx::PgExecutor;

#[derive(Debug, Clone, Default)]
pub struct NewMetrics {
    pub queue_id: i32,
    pub pending_count: i32,
    pub processing_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub avg_processing_time: Option<f64>,
    pub max_processing_time: Option<f64>,
    pub min_processing_time: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub error_rate: f64,
    pub success_rate: f64,
}

pub async fn insert(db: impl PgExecutor<'_>, sample: &NewMetrics) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO queue_metrics (
            queue_id, pending_count, processing_count, completed_count, failed_count,
            avg_processing_time, max_processing_time, min_processing_time,
            cpu_usage, memory_usage, disk_usage, error_rate, success_rate
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(sample.queue_id)
    .bind(sample.pending_count)
    .bind(sample.processing_count)
    .bind(sample.completed_count)
    .bind(sample.failed_count)
    .bind(sample.avg_processing_time)
    .bind(sample.max_processing_time)
    .bind(sample.min_processing_time)
    .bind(sample.cpu_usage)
    .bind(sample.memory_usage)
    .bind(sample.disk_usage)
    .bind(sample.error_rate)
    .bind(sample.success_rate)
    .execute(db)
    .await?;

    Ok(())
}

/// The most recent sample for a queue, if any.
pub async fn latest(db: impl PgExecutor<'_>, queue_id: i32) -> sqlx::Result<Option<QueueMetrics>> {
    sqlx::query_as::<_, QueueMetrics>(
        "SELECT * FROM queue_metrics
          WHERE queue_id = $1
          ORDER BY timestamp DESC
          LIMIT 1",
    )
    .bind(queue_id)
    .fetch_optional(db)
    .await
}
