//! The singleton system status row.
//!
//! The table constrains id to 1 and every writer upserts, so readers never
//! have to pick between multiple rows.

use chrono::{DateTime, Utc};
use foreman_core::health::HealthStatus;
use foreman_core::model::SystemStatus;
use sqlx::PgExecutor;

/// Make sure the row exists, stamping version/environment on first boot.
pub async fn init(
    db: impl PgExecutor<'_>,
    version: &str,
    environment: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO system_status (id, version, environment)
         VALUES (1, $1, $2)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(version)
    .bind(environment)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn get(db: impl PgExecutor<'_>) -> sqlx::Result<Option<SystemStatus>> {
    sqlx::query_as::<_, SystemStatus>("SELECT * FROM system_status WHERE id = 1")
        .fetch_optional(db)
        .await
}

/// Written by the component health sweep.
pub async fn update_health(
    db: impl PgExecutor<'_>,
    overall: HealthStatus,
    database: HealthStatus,
    broker: HealthStatus,
    checked_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE system_status
            SET overall_health = $1,
                database_health = $2,
                broker_health = $3,
                is_operational = $1 <> 'critical',
                last_health_check = $4,
                last_updated = CURRENT_TIMESTAMP
          WHERE id = 1",
    )
    .bind(overall)
    .bind(database)
    .bind(broker)
    .bind(checked_at)
    .execute(db)
    .await?;

    Ok(())
}

/// Written by the per-queue monitoring loop.
pub async fn update_queue_health(
    db: impl PgExecutor<'_>,
    queue_health: HealthStatus,
    total_queues: i64,
    active_queues: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE system_status
            SET queue_health = $1,
                total_queues = $2,
                active_queues = $3,
                last_updated = CURRENT_TIMESTAMP
          WHERE id = 1",
    )
    .bind(queue_health)
    .bind(total_queues as i32)
    .bind(active_queues as i32)
    .execute(db)
    .await?;

    Ok(())
}

/// Written by the shutdown controller when an emergency stop begins.
pub async fn mark_shutdown(db: impl PgExecutor<'_>, reason: &str) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE system_status
            SET is_operational = FALSE,
                shutdown_requested = TRUE,
                shutdown_reason = $1,
                overall_health = 'critical',
                last_updated = CURRENT_TIMESTAMP
          WHERE id = 1",
    )
    .bind(reason)
    .execute(db)
    .await?;

    Ok(())
}
