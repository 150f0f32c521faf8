//! The broker port: how task executions travel to workers.
//!
//! The default [`PgBroker`] keeps the wire inside Postgres. A dispatch row
//! is the in-flight execution; inserting one fires a `foreman:dispatch`
//! notification that wakes workers, and workers claim rows with
//! `FOR UPDATE SKIP LOCKED`. Because the broker shares the store's
//! database, a submit can ride in the same transaction as the task insert,
//! so the two can never disagree about whether a submission happened.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{Error, Result};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Notification channel workers listen on for new or requeued dispatches.
pub const DISPATCH_CHANNEL: &str = "foreman:dispatch";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "dispatch_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Revoked,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Revoked => "revoked",
        }
    }
}

/// The payload envelope carried by a dispatch, mirroring what the worker
/// needs to execute without touching the task row first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub task_type: String,
    pub task_name: String,
    pub payload: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
}

/// An in-flight execution as stored by [`PgBroker`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Dispatch {
    pub id: Uuid,
    pub queue_name: String,
    pub priority: i32,
    pub payload: Json<DispatchEnvelope>,
    pub state: DispatchState,
    pub attempt: i32,
    pub eta: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub claimed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A submission handed to the broker.
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub envelope: &'a DispatchEnvelope,
    pub queue_name: &'a str,
    pub priority_value: i32,
    pub eta: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The broker's view of one execution, shaped like what a status poller
/// wants to show.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerTaskStatus {
    pub id: String,
    pub state: String,
    pub result: Option<Value>,
    pub traceback: Option<String>,
    pub successful: bool,
    pub failed: bool,
}

impl BrokerTaskStatus {
    pub fn from_dispatch(dispatch: &Dispatch) -> Self {
        Self {
            id: dispatch.id.to_string(),
            state: dispatch.state.as_str().to_owned(),
            result: dispatch.result.clone(),
            traceback: dispatch.error.clone(),
            successful: dispatch.state == DispatchState::Succeeded,
            failed: matches!(dispatch.state, DispatchState::Failed | DispatchState::Revoked),
        }
    }
}

/// Submit, inspect, and revoke externally dispatched task executions.
///
/// `submit` takes the caller's store connection so implementations backed
/// by the same database can make submission atomic with task persistence;
/// remote implementations are free to ignore it.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit(
        &self,
        conn: &mut PgConnection,
        request: DispatchRequest<'_>,
    ) -> Result<String>;

    async fn status(&self, execution_id: &str) -> Result<BrokerTaskStatus>;

    /// Best-effort revocation. Returns whether any in-flight execution was
    /// actually revoked; an execution that already completed is left alone.
    async fn revoke(&self, execution_id: &str, terminate: bool) -> Result<bool>;
}

pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn submit(
        &self,
        conn: &mut PgConnection,
        request: DispatchRequest<'_>,
    ) -> Result<String> {
        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO dispatches (id, queue_name, priority, payload, state, eta, expires_at)
             VALUES ($1, $2, $3, $4, 'queued', $5, $6)",
        )
        .bind(id)
        .bind(request.queue_name)
        .bind(request.priority_value)
        .bind(Json(request.envelope))
        .bind(request.eta)
        .bind(request.expires_at)
        .execute(&mut *conn)
        .await?;

        Ok(id.to_string())
    }

    async fn status(&self, execution_id: &str) -> Result<BrokerTaskStatus> {
        let id = parse_execution_id(execution_id)?;

        let dispatch = sqlx::query_as::<_, Dispatch>("SELECT * FROM dispatches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Broker(format!("unknown execution id {execution_id}")))?;

        Ok(BrokerTaskStatus::from_dispatch(&dispatch))
    }

    async fn revoke(&self, execution_id: &str, terminate: bool) -> Result<bool> {
        let id = parse_execution_id(execution_id)?;

        // Without terminate only queued work is pulled back; with it a
        // running dispatch is flagged too, and the worker drops its result
        // when it notices.
        let result = if terminate {
            sqlx::query(
                "UPDATE dispatches SET state = 'revoked', updated_at = CURRENT_TIMESTAMP
                  WHERE id = $1 AND state IN ('queued', 'running')",
            )
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE dispatches SET state = 'revoked', updated_at = CURRENT_TIMESTAMP
                  WHERE id = $1 AND state = 'queued'",
            )
            .bind(id)
            .execute(&self.pool)
            .await?
        };

        Ok(result.rows_affected() > 0)
    }
}

fn parse_execution_id(execution_id: &str) -> Result<Uuid> {
    execution_id
        .parse()
        .map_err(|_| Error::Broker(format!("malformed execution id {execution_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(state: DispatchState) -> Dispatch {
        Dispatch {
            id: Uuid::new_v4(),
            queue_name: "default".into(),
            priority: 5,
            payload: Json(DispatchEnvelope {
                task_type: "noop".into(),
                task_name: "t".into(),
                payload: Value::Null,
                correlation_id: None,
                tags: None,
            }),
            state,
            attempt: 0,
            eta: None,
            expires_at: None,
            result: None,
            error: None,
            claimed_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_flags_follow_the_dispatch_state() {
        let status = BrokerTaskStatus::from_dispatch(&dispatch(DispatchState::Succeeded));
        assert!(status.successful);
        assert!(!status.failed);

        let status = BrokerTaskStatus::from_dispatch(&dispatch(DispatchState::Failed));
        assert!(!status.successful);
        assert!(status.failed);

        let status = BrokerTaskStatus::from_dispatch(&dispatch(DispatchState::Revoked));
        assert!(status.failed);

        let status = BrokerTaskStatus::from_dispatch(&dispatch(DispatchState::Running));
        assert!(!status.successful);
        assert!(!status.failed);
    }

    #[test]
    fn malformed_execution_ids_are_broker_errors() {
        let error = parse_execution_id("not-a-uuid").unwrap_err();
        assert!(matches!(error, Error::Broker(_)));
    }
}
