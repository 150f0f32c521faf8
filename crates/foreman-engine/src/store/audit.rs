//! Audit trail for administrative actions.

use serde_json::Value;
use sqlx::PgExecutor;

pub async fn record(
    db: impl PgExecutor<'_>,
    event_type: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    action: &str,
    description: Option<&str>,
    metadata: Option<&Value>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (event_type, entity_type, entity_id, action, description, metadata)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(event_type)
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(description)
    .bind(metadata)
    .execute(db)
    .await?;

    Ok(())
}
