//! Alarm repository.

use chrono::{DateTime, Utc};
use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};
use foreman_core::model::SystemAlarm;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgExecutor;

pub async fn insert(db: impl PgExecutor<'_>, event: &AlarmEvent) -> sqlx::Result<SystemAlarm> {
    sqlx::query_as::<_, SystemAlarm>(
        "INSERT INTO system_alarms (
            alarm_type, severity, title, description, queue_name, task_id,
            component, context_data, tags, is_active, acknowledged
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, FALSE)
        RETURNING *",
    )
    .bind(event.alarm_type)
    .bind(event.severity)
    .bind(&event.title)
    .bind(&event.description)
    .bind(&event.queue_name)
    .bind(event.task_id)
    .bind(&event.component)
    .bind(&event.context_data)
    .bind(event.tags.as_ref().map(Json))
    .fetch_one(db)
    .await
}

pub async fn by_id(db: impl PgExecutor<'_>, id: i32) -> sqlx::Result<Option<SystemAlarm>> {
    sqlx::query_as::<_, SystemAlarm>("SELECT * FROM system_alarms WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn active_all(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<SystemAlarm>> {
    sqlx::query_as::<_, SystemAlarm>(
        "SELECT * FROM system_alarms WHERE is_active ORDER BY triggered_at DESC",
    )
    .fetch_all(db)
    .await
}

/// The most recent alarm of a type triggered since the cutoff. Used for
/// the persistence-level dedup window.
pub async fn most_recent(
    db: impl PgExecutor<'_>,
    alarm_type: AlarmType,
    since: DateTime<Utc>,
) -> sqlx::Result<Option<SystemAlarm>> {
    sqlx::query_as::<_, SystemAlarm>(
        "SELECT * FROM system_alarms
          WHERE alarm_type = $1 AND triggered_at > $2
          ORDER BY triggered_at DESC
          LIMIT 1",
    )
    .bind(alarm_type)
    .bind(since)
    .fetch_optional(db)
    .await
}

/// Fold a repeat occurrence into an existing active alarm. The stored
/// severity only ever ratchets upwards, so an escalated repeat turns the
/// row critical.
pub async fn touch(
    db: impl PgExecutor<'_>,
    id: i32,
    description: &str,
    context_data: Option<&Value>,
    severity: AlarmSeverity,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE system_alarms
            SET occurrence_count = occurrence_count + 1,
                last_occurrence = CURRENT_TIMESTAMP,
                description = $2,
                context_data = $3,
                severity = GREATEST(severity, $4)
          WHERE id = $1",
    )
    .bind(id)
    .bind(description)
    .bind(context_data)
    .bind(severity)
    .execute(db)
    .await?;

    Ok(())
}

pub async fn acknowledge(
    db: impl PgExecutor<'_>,
    id: i32,
    acknowledged_by: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE system_alarms
            SET acknowledged = TRUE,
                acknowledged_by = $2,
                acknowledged_at = CURRENT_TIMESTAMP
          WHERE id = $1",
    )
    .bind(id)
    .bind(acknowledged_by)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn resolve(db: impl PgExecutor<'_>, id: i32) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE system_alarms
            SET is_active = FALSE,
                resolved_at = CURRENT_TIMESTAMP
          WHERE id = $1",
    )
    .bind(id)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}
