//! The worker: claims dispatches from the broker and drives the task
//! lifecycle state machine around handler invocations.
//!
//! A worker registers itself in the `workers` table and then runs three
//! loops joined into one task: a jittered heartbeat, a reaper that expires
//! dead workers and requeues their in-flight dispatches, and the event
//! loop that claims ready dispatches (woken by LISTEN/NOTIFY, with a
//! periodic poll as a backstop for delayed etas and missed notifications).
//! Executions run on a `JoinSet` bounded by `max_tasks`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use foreman_core::model::{Task, TaskStatus};
use foreman_core::{Config, Error};
use futures_util::FutureExt;
use rand::Rng;
use serde_json::{json, Value};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::alarm::AlarmEngine;
use crate::broker::{Dispatch, DispatchEnvelope, DISPATCH_CHANNEL};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::registry::TaskRegistry;
use crate::store::{tasks, Store};

/// Retry delays are clamped to one hour regardless of the attempt count.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Worker-local tuning knobs, separate from the service [`Config`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum concurrently executing dispatches.
    pub max_tasks: usize,
    /// The period with which the worker refreshes its heartbeat row. The
    /// actual period is jittered downwards by up to a quarter to avoid
    /// thundering herds on the database.
    pub heartbeat_interval: Duration,
    /// A worker whose heartbeat is older than this is considered dead and
    /// its claimed dispatches are requeued.
    pub heartbeat_timeout: Duration,
    /// Poll cadence of the claim loop when no notifications arrive.
    pub poll_interval: Duration,
    /// Bounded retries for store writes during lifecycle transitions.
    pub store_retry_attempts: u32,
    pub store_retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_tasks: 4,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            store_retry_attempts: 3,
            store_retry_delay: Duration::from_millis(250),
        }
    }
}

impl WorkerOptions {
    pub fn max_tasks(mut self, value: usize) -> Self {
        self.max_tasks = value.max(1);
        self
    }

    pub fn heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = value;
        self
    }

    pub fn heartbeat_timeout(mut self, value: Duration) -> Self {
        self.heartbeat_timeout = value;
        self
    }

    pub fn poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }
}

struct SharedState {
    shutdown: ShutdownFlag,
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    config: Config,
    options: WorkerOptions,
    alarms: Option<Arc<AlarmEngine>>,
}

pub struct WorkerBuilder {
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    config: Config,
    options: Option<WorkerOptions>,
    alarms: Option<Arc<AlarmEngine>>,
    migrate: bool,
}

impl WorkerBuilder {
    pub fn new(pool: PgPool, registry: Arc<TaskRegistry>) -> Self {
        Self {
            pool,
            registry,
            config: Config::default(),
            options: None,
            alarms: None,
            migrate: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Attach an alarm engine so persistent store failures during state
    /// transitions raise a SYSTEM_ERROR alarm.
    pub fn alarms(mut self, alarms: Arc<AlarmEngine>) -> Self {
        self.alarms = Some(alarms);
        self
    }

    /// Whether to apply pending schema migrations during
    /// [`WorkerBuilder::build`]. Reasonable for a single-worker deployment;
    /// larger clusters should migrate out of band.
    pub fn migrate(mut self, migrate: bool) -> Self {
        self.migrate = migrate;
        self
    }

    pub async fn build(self) -> anyhow::Result<Worker> {
        if self.migrate {
            Store::from_pool(self.pool.clone())
                .migrate()
                .await
                .context("failed to migrate the database")?;
        }

        let options = self
            .options
            .unwrap_or_else(|| WorkerOptions::default().max_tasks(self.config.broker.worker_concurrency));

        Ok(Worker {
            shared: Arc::new(SharedState {
                shutdown: ShutdownFlag::new(),
                pool: self.pool,
                registry: self.registry,
                config: self.config,
                options,
                alarms: self.alarms,
            }),
            // A worker id of -1 never overlaps with a database-assigned id.
            worker_id: -1,
            executions: JoinSet::new(),
        })
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: ShutdownFlag,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.raise();
    }
}

pub struct Worker {
    shared: Arc<SharedState>,
    worker_id: i64,
    executions: JoinSet<()>,
}

impl Worker {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shared.shutdown.clone(),
        }
    }

    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shared.shutdown.clone()
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.worker_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO workers (heartbeat_at) VALUES (CURRENT_TIMESTAMP) RETURNING id",
        )
        .fetch_one(&self.shared.pool)
        .await?;

        tracing::info!("worker id is {}", self.worker_id);

        let worker_id = self.worker_id;
        let heartbeat = Self::heartbeat(self.shared.clone(), worker_id);
        let reaper = Self::reap_expired(self.shared.clone(), worker_id);
        let process = self.process_events();

        // All three run in this task so that if one of them wedges the
        // heartbeat stops and another worker takes over our claims.
        let (heartbeat, reaper, process) = tokio::join!(heartbeat, reaper, process);

        tracing::info!("deleting worker database entry");
        let cleanup = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(self.worker_id)
            .execute(&self.shared.pool)
            .await
            .context("failed to delete the worker entry from the database");

        self.executions.abort_all();

        process?;
        heartbeat?;
        reaper?;
        cleanup?;

        Ok(())
    }

    async fn heartbeat(shared: Arc<SharedState>, worker_id: i64) -> anyhow::Result<()> {
        let _guard = ShutdownGuard::new(&shared.shutdown);
        let mut shutdown = std::pin::pin!(shared.shutdown.wait());
        let mut next = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.as_mut() => break,
                _ = tokio::time::sleep_until(next) => ()
            }

            let row = sqlx::query_scalar::<_, i64>(
                "UPDATE workers SET heartbeat_at = CURRENT_TIMESTAMP WHERE id = $1 RETURNING id",
            )
            .bind(worker_id)
            .fetch_optional(&shared.pool)
            .await?;

            // Our row is gone: another worker decided we were dead. Stop so
            // we don't run tasks that have been handed to someone else.
            if row.is_none() {
                shared.shutdown.raise();
                anyhow::bail!("worker entry was deleted from the database");
            }

            let mut interval = shared.options.heartbeat_interval;
            let jitter = rand::thread_rng().gen_range(0..(interval / 4).as_nanos().max(1));
            interval -= Duration::from_nanos(jitter as u64);

            next += interval;
        }

        Ok(())
    }

    /// Expire workers that stopped heartbeating, requeue their in-flight
    /// dispatches, and revoke queued dispatches that passed their expiry.
    async fn reap_expired(shared: Arc<SharedState>, worker_id: i64) -> anyhow::Result<()> {
        let _guard = ShutdownGuard::new(&shared.shutdown);
        let mut shutdown = std::pin::pin!(shared.shutdown.wait());
        let mut next = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.as_mut() => break,
                _ = tokio::time::sleep_until(next) => ()
            }

            let mut tx = shared.pool.begin().await?;

            let timeout_secs = shared.options.heartbeat_timeout.as_secs_f64();
            let expired = sqlx::query(
                "DELETE FROM workers
                  WHERE CURRENT_TIMESTAMP - heartbeat_at > make_interval(secs => $1)
                    AND id <> $2",
            )
            .bind(timeout_secs)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

            if expired.rows_affected() > 0 {
                tracing::info!("expired {} inactive workers", expired.rows_affected());
            }

            let orphaned = sqlx::query(
                "UPDATE dispatches
                    SET state = 'queued', claimed_by = NULL, updated_at = CURRENT_TIMESTAMP
                  WHERE state = 'running'
                    AND claimed_by IS NOT NULL
                    AND claimed_by NOT IN (SELECT id FROM workers)",
            )
            .execute(&mut *tx)
            .await?;

            if orphaned.rows_affected() > 0 {
                tracing::info!("requeued {} orphaned dispatches", orphaned.rows_affected());
            }

            sqlx::query(
                "UPDATE dispatches
                    SET state = 'revoked', error = 'dispatch expired before execution',
                        updated_at = CURRENT_TIMESTAMP
                  WHERE state = 'queued' AND expires_at < CURRENT_TIMESTAMP",
            )
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            let mut interval = shared.options.heartbeat_timeout / 2;
            let jitter = rand::thread_rng().gen_range(0..(interval / 2).as_nanos().max(1));
            interval -= Duration::from_nanos(jitter as u64);

            next += interval;
        }

        Ok(())
    }

    async fn process_events(&mut self) -> anyhow::Result<()> {
        let shutdown = self.shared.shutdown.clone();
        let _guard = ShutdownGuard::new(&shutdown);
        let mut shutdown = std::pin::pin!(shutdown.wait());

        let mut listener = PgListener::connect_with(&self.shared.pool).await?;
        listener.listen(DISPATCH_CHANNEL).await?;

        let mut poll = tokio::time::interval(self.shared.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.spawn_ready_dispatches().await?;

            tokio::select! {
                biased;

                _ = shutdown.as_mut() => break,
                _ = self.executions.join_next(), if !self.executions.is_empty() => {
                    while self.executions.try_join_next().is_some() {}
                }
                notification = listener.try_recv() => {
                    match notification {
                        // A dispatch became ready; the claim at the top of
                        // the loop picks it up.
                        Ok(Some(_)) => (),
                        // Connection dropped and was re-established; the
                        // periodic poll covers anything we missed.
                        Ok(None) => (),
                        Err(e) => {
                            tracing::warn!("dispatch listener error: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = poll.tick() => (),
            }
        }

        Ok(())
    }

    /// Claim up to the remaining capacity of ready dispatches and spawn an
    /// execution for each.
    async fn spawn_ready_dispatches(&mut self) -> anyhow::Result<()> {
        let allowed = self
            .shared
            .options
            .max_tasks
            .saturating_sub(self.executions.len());
        if allowed == 0 {
            return Ok(());
        }

        let dispatches = sqlx::query_as::<_, Dispatch>(
            "WITH selected AS (
                SELECT id FROM dispatches
                 WHERE state = 'queued'
                   AND (eta IS NULL OR eta <= CURRENT_TIMESTAMP)
                   AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
                 ORDER BY priority DESC, created_at
                 FOR UPDATE SKIP LOCKED
                 LIMIT $2
            )
            UPDATE dispatches
               SET state = 'running', claimed_by = $1, updated_at = CURRENT_TIMESTAMP
              FROM selected
             WHERE dispatches.id = selected.id
             RETURNING dispatches.*",
        )
        .bind(self.worker_id)
        .bind(allowed as i64)
        .fetch_all(&self.shared.pool)
        .await?;

        if !dispatches.is_empty() {
            tracing::info!("claimed {} dispatches", dispatches.len());
        }

        for dispatch in dispatches {
            let shared = self.shared.clone();
            let dispatch_id = dispatch.id;

            self.executions.spawn(
                async move {
                    if let Err(e) = Self::run_dispatch(shared, dispatch).await {
                        tracing::error!(%dispatch_id, "dispatch execution errored: {e:#}");
                    }
                }
                .instrument(tracing::info_span!("dispatch", %dispatch_id)),
            );
        }

        Ok(())
    }

    async fn run_dispatch(shared: Arc<SharedState>, dispatch: Dispatch) -> anyhow::Result<()> {
        let dispatch_id = dispatch.id;
        let envelope = dispatch.payload.0.clone();
        let execution_id = dispatch_id.to_string();

        // Bind the broker execution back to its task row. A missing row is
        // tolerated: the execution proceeds without state tracking.
        let task = Self::locate_task(&shared, &execution_id).await?;
        if task.is_none() {
            tracing::warn!(%dispatch_id, "no task row for dispatch, executing untracked");
        }

        if let Some(task) = &task {
            if task.status == TaskStatus::Cancelled {
                sqlx::query(
                    "UPDATE dispatches SET state = 'revoked', updated_at = CURRENT_TIMESTAMP
                      WHERE id = $1 AND state = 'running'",
                )
                .bind(dispatch_id)
                .execute(&shared.pool)
                .await?;
                return Ok(());
            }

            Self::transition(&shared, &execution_id, || {
                tasks::mark_processing(&shared.pool, task.id)
            })
            .await?;
        }

        tracing::info!(
            task_type = %envelope.task_type,
            task_name = %envelope.task_name,
            "executing dispatch"
        );

        let started = Instant::now();
        let outcome = Self::execute_handler(&shared, &envelope).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                let result = wrap_result(value);
                tracing::info!(
                    task_type = %envelope.task_type,
                    duration_seconds = elapsed.as_secs_f64(),
                    "dispatch completed"
                );

                if let Some(task) = &task {
                    Self::transition(&shared, &execution_id, || {
                        tasks::mark_completed(&shared.pool, task.id, &result)
                    })
                    .await?;
                }

                sqlx::query(
                    "UPDATE dispatches
                        SET state = 'succeeded', result = $2, updated_at = CURRENT_TIMESTAMP
                      WHERE id = $1 AND state = 'running'",
                )
                .bind(dispatch_id)
                .bind(&result)
                .execute(&shared.pool)
                .await?;
            }
            Err(failure) => {
                tracing::warn!(
                    task_type = %envelope.task_type,
                    "dispatch failed: {}",
                    failure.message
                );

                let retried = match &task {
                    Some(task) => {
                        Self::transition(&shared, &execution_id, || {
                            tasks::mark_retrying(
                                &shared.pool,
                                task.id,
                                &failure.message,
                                &failure.traceback,
                            )
                        })
                        .await?
                    }
                    None => None,
                };

                match retried {
                    Some(retry_count) => {
                        let delay = retry_backoff(
                            shared.config.broker.default_retry_delay,
                            dispatch.attempt as u32,
                        );
                        let eta = Utc::now() + chrono::Duration::from_std(delay)?;

                        tracing::info!(
                            retry_count,
                            delay_seconds = delay.as_secs(),
                            "requeueing dispatch for retry"
                        );

                        sqlx::query(
                            "UPDATE dispatches
                                SET state = 'queued', claimed_by = NULL,
                                    attempt = attempt + 1, eta = $2, error = $3,
                                    updated_at = CURRENT_TIMESTAMP
                              WHERE id = $1 AND state = 'running'",
                        )
                        .bind(dispatch_id)
                        .bind(eta)
                        .bind(&failure.message)
                        .execute(&shared.pool)
                        .await?;
                    }
                    None => {
                        if let Some(task) = &task {
                            Self::transition(&shared, &execution_id, || {
                                tasks::mark_failed(
                                    &shared.pool,
                                    task.id,
                                    &failure.message,
                                    &failure.traceback,
                                )
                            })
                            .await?;
                        }

                        sqlx::query(
                            "UPDATE dispatches
                                SET state = 'failed', error = $2, updated_at = CURRENT_TIMESTAMP
                              WHERE id = $1 AND state = 'running'",
                        )
                        .bind(dispatch_id)
                        .bind(&failure.traceback)
                        .execute(&shared.pool)
                        .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the registered handler under the hard time limit, catching
    /// panics so a misbehaving handler cannot take the worker down.
    async fn execute_handler(
        shared: &SharedState,
        envelope: &DispatchEnvelope,
    ) -> Result<Value, HandlerFailure> {
        let hard_limit = shared.config.broker.time_limit;
        let invocation = shared
            .registry
            .execute(&envelope.task_type, envelope.payload.clone());

        match tokio::time::timeout(hard_limit, AssertUnwindSafe(invocation).catch_unwind()).await {
            Err(_) => Err(HandlerFailure::message(format!(
                "task execution exceeded the hard time limit of {}s",
                hard_limit.as_secs()
            ))),
            Ok(Err(payload)) => {
                let message: &str = if let Some(message) = payload.downcast_ref::<String>() {
                    message
                } else if let Some(message) = payload.downcast_ref::<&str>() {
                    message
                } else {
                    "Box<dyn Any>"
                };

                Err(HandlerFailure::message(format!("handler panicked: {message}")))
            }
            Ok(Ok(Err(Error::Handler(message)))) => Err(HandlerFailure {
                traceback: message.clone(),
                message: first_line(&message),
            }),
            Ok(Ok(Err(other))) => Err(HandlerFailure::message(other.to_string())),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    async fn locate_task(shared: &SharedState, execution_id: &str) -> anyhow::Result<Option<Task>> {
        match Self::with_store_retry(shared, || {
            tasks::by_worker_id(&shared.pool, execution_id)
        })
        .await
        {
            Ok(task) => Ok(task),
            Err(e) => {
                Self::store_failure_alarm(shared, execution_id, &e).await;
                Err(e.into())
            }
        }
    }

    /// Apply a lifecycle transition write with bounded retries; a
    /// persistent store failure raises a SYSTEM_ERROR alarm and surfaces
    /// the error to the broker loop.
    async fn transition<T, F, Fut>(
        shared: &SharedState,
        execution_id: &str,
        op: F,
    ) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = sqlx::Result<T>>,
    {
        match Self::with_store_retry(shared, op).await {
            Ok(value) => Ok(value),
            Err(e) => {
                Self::store_failure_alarm(shared, execution_id, &e).await;
                Err(e.into())
            }
        }
    }

    async fn with_store_retry<T, F, Fut>(shared: &SharedState, op: F) -> sqlx::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = sqlx::Result<T>>,
    {
        let attempts = shared.options.store_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(shared.options.store_retry_delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!("store write failed (attempt {}): {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("at least one attempt is always made"))
    }

    async fn store_failure_alarm(shared: &SharedState, execution_id: &str, error: &sqlx::Error) {
        use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};

        let Some(alarms) = &shared.alarms else { return };

        let event = AlarmEvent::new(
            AlarmType::SystemError,
            AlarmSeverity::Error,
            "Task state update failed",
            format!("Persistent store failure while updating task state: {error}"),
        )
        .for_component("worker")
        .with_context(json!({
            "broker_task_id": execution_id,
            "error": error.to_string(),
        }));

        if let Err(e) = alarms.trigger(event).await {
            tracing::error!("failed to raise store-failure alarm: {e}");
        }
    }
}

struct HandlerFailure {
    message: String,
    traceback: String,
}

impl HandlerFailure {
    fn message(message: String) -> Self {
        Self {
            traceback: message.clone(),
            message,
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).to_owned()
}

/// Exponential backoff for retries, clamped to one hour.
pub(crate) fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(MAX_RETRY_DELAY).min(MAX_RETRY_DELAY)
}

/// Handler results are persisted as objects; bare scalars and arrays are
/// wrapped so the column is always an object.
pub(crate) fn wrap_result(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "value": value })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let base = Duration::from_secs(60);

        assert_eq!(retry_backoff(base, 0), Duration::from_secs(60));
        assert_eq!(retry_backoff(base, 1), Duration::from_secs(120));
        assert_eq!(retry_backoff(base, 2), Duration::from_secs(240));
        assert_eq!(retry_backoff(base, 5), Duration::from_secs(1920));
        assert_eq!(retry_backoff(base, 6), MAX_RETRY_DELAY);
        assert_eq!(retry_backoff(base, 31), MAX_RETRY_DELAY);
        assert_eq!(retry_backoff(base, 64), MAX_RETRY_DELAY);
    }

    #[test]
    fn scalar_results_are_wrapped() {
        assert_eq!(wrap_result(json!(42)), json!({ "value": 42 }));
        assert_eq!(wrap_result(json!("done")), json!({ "value": "done" }));
        assert_eq!(wrap_result(json!([1, 2])), json!({ "value": [1, 2] }));
        assert_eq!(wrap_result(json!(null)), json!({ "value": null }));
        assert_eq!(wrap_result(json!({ "ok": true })), json!({ "ok": true }));
    }

    #[test]
    fn first_line_truncates_multiline_errors() {
        assert_eq!(first_line("boom\ncaused by: x"), "boom");
        assert_eq!(first_line("single"), "single");
    }
}
