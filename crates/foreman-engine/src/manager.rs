//! The queue manager: the submission path, cancellation, per-queue health
//! derivation, and the queue monitoring loop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::health::HealthStatus;
use foreman_core::model::{Queue, QueueHealth, Task, TaskSubmission};
use foreman_core::{Config, Error, MonitorConfig, Result};
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Broker, BrokerTaskStatus, DispatchEnvelope, DispatchRequest};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::health::{host_snapshot, HostSnapshot};
use crate::store::tasks::{NewTask, QueueStats, TaskFilter};
use crate::store::{audit, metrics, queues, status, tasks, Store};

pub use crate::store::queues::{NewQueue, QueueUpdate};

/// Receives every queue health observation produced by the monitoring
/// loop. The alarm engine is the primary subscriber.
#[async_trait]
pub trait QueueHealthObserver: Send + Sync {
    async fn observe(&self, health: &QueueHealth);
}

/// A task as reported to API consumers: the persistent row plus derived
/// fields and the broker's live view of the execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub duration_seconds: Option<f64>,
    pub is_overdue: bool,
    pub broker_status: Option<BrokerTaskStatus>,
}

impl TaskSnapshot {
    fn new(task: Task, broker_status: Option<BrokerTaskStatus>) -> Self {
        let now = Utc::now();
        Self {
            duration_seconds: task.duration_seconds(),
            is_overdue: task.is_overdue(now),
            task,
            broker_status,
        }
    }
}

/// Derive a queue's health from its stats. Pure so the issue conditions
/// can be exercised without a store.
pub(crate) fn derive_queue_health(
    queue_name: &str,
    stats: QueueStats,
    avg_processing_time: f64,
    last_processed_at: Option<DateTime<Utc>>,
    overdue_count: i64,
    now: DateTime<Utc>,
    config: &MonitorConfig,
) -> QueueHealth {
    let processed = stats.completed + stats.failed;
    let error_rate = if processed > 0 {
        stats.failed as f64 / processed as f64 * 100.0
    } else {
        0.0
    };

    let mut issues = Vec::new();

    if stats.pending > config.backup_threshold {
        issues.push(format!("Queue backup: {} pending tasks", stats.pending));
    }

    if error_rate > config.error_threshold {
        issues.push(format!("High error rate: {error_rate:.1}%"));
    }

    if let Some(last) = last_processed_at {
        let idle = now.signed_duration_since(last);
        if idle.num_seconds() > config.processing_timeout.as_secs() as i64 {
            issues.push(format!(
                "Processing timeout: no completions for {} seconds",
                idle.num_seconds()
            ));
        }
    }

    if overdue_count > 0 {
        issues.push(format!("{overdue_count} overdue tasks"));
    }

    QueueHealth {
        queue_name: queue_name.to_owned(),
        is_healthy: issues.is_empty(),
        pending_count: stats.pending,
        processing_count: stats.processing,
        completed_count: stats.completed,
        failed_count: stats.failed,
        error_rate,
        avg_processing_time,
        last_processed_at,
        issues,
    }
}

pub struct QueueManager {
    store: Store,
    broker: Arc<dyn Broker>,
    config: Config,
    observers: parking_lot::RwLock<Vec<Arc<dyn QueueHealthObserver>>>,
}

impl QueueManager {
    pub fn new(store: Store, broker: Arc<dyn Broker>, config: Config) -> Self {
        Self {
            store,
            broker,
            config,
            observers: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueHealthObserver>) {
        self.observers.write().push(observer);
    }

    /// Make sure the `default` queue exists.
    pub async fn ensure_default_queue(&self) -> Result<Queue> {
        let queue = queues::create_if_absent(
            self.store.pool(),
            &NewQueue {
                description: Some("Default processing queue".to_owned()),
                ..NewQueue::named("default")
            },
        )
        .await?;

        Ok(queue)
    }

    /// Submit a task. Queue lookup, broker submission, and the task insert
    /// all ride in one transaction, so the task row exists exactly when
    /// the broker accepted the submission.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<Uuid> {
        let mut tx = self.store.begin().await?;

        let queue = queues::by_name(&mut *tx, &submission.queue_name)
            .await?
            .ok_or_else(|| Error::QueueNotFound(submission.queue_name.clone()))?;

        if !queue.is_active {
            return Err(Error::QueueInactive(queue.name));
        }

        let timeout_seconds = submission
            .timeout_seconds
            .unwrap_or(queue.timeout_seconds as i64);
        let retry_limit = submission.retry_limit.unwrap_or(queue.retry_limit);

        let now = Utc::now();
        let scheduled_at = submission.scheduled_at.unwrap_or(now);
        let timeout_at = (timeout_seconds > 0)
            .then(|| scheduled_at.max(now) + chrono::Duration::seconds(timeout_seconds));

        let envelope = DispatchEnvelope {
            task_type: submission.task_type.clone(),
            task_name: submission.task_name.clone(),
            payload: submission.payload.clone(),
            correlation_id: submission.correlation_id.clone(),
            tags: submission.tags.clone(),
        };

        let execution_id = self
            .broker
            .submit(
                &mut *tx,
                DispatchRequest {
                    envelope: &envelope,
                    queue_name: &queue.name,
                    priority_value: submission.priority.broker_value(),
                    eta: submission.scheduled_at,
                    expires_at: timeout_at,
                },
            )
            .await?;

        let task = tasks::insert(
            &mut *tx,
            &NewTask {
                id: Uuid::new_v4(),
                queue_id: queue.id,
                task_type: submission.task_type,
                task_name: submission.task_name,
                payload: submission.payload,
                priority: submission.priority,
                max_retries: retry_limit,
                correlation_id: submission.correlation_id,
                scheduled_at,
                timeout_at,
                worker_id: execution_id.clone(),
                tags: submission.tags,
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            task_id = %task.id,
            execution_id = %execution_id,
            queue = %queue.name,
            task_type = %task.task_type,
            "task submitted"
        );

        Ok(task.id)
    }

    pub async fn task_status(&self, task_id: Uuid) -> Result<TaskSnapshot> {
        let task = tasks::by_id(self.store.pool(), task_id)
            .await?
            .ok_or(Error::TaskNotFound(task_id))?;

        let broker_status = match &task.worker_id {
            Some(execution_id) => match self.broker.status(execution_id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(%task_id, "failed to fetch broker status: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(TaskSnapshot::new(task, broker_status))
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(tasks::list(self.store.pool(), filter).await?)
    }

    /// Cancel a task: best-effort broker revocation, then the terminal
    /// transition. Cancelling an already terminal task is a no-op success.
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        let task = tasks::by_id(self.store.pool(), task_id)
            .await?
            .ok_or(Error::TaskNotFound(task_id))?;

        if task.status.is_terminal() {
            return Ok(());
        }

        if let Some(execution_id) = &task.worker_id {
            if let Err(e) = self.broker.revoke(execution_id, true).await {
                tracing::warn!(%task_id, "broker revoke failed: {e}");
            }
        }

        tasks::cancel(self.store.pool(), task_id).await?;
        tracing::info!(%task_id, "task cancelled");

        Ok(())
    }

    /// Compute a queue's health from one consistent store snapshot.
    pub async fn queue_health(&self, queue_name: &str) -> Result<QueueHealth> {
        let mut tx = self.store.begin().await?;

        let queue = queues::by_name(&mut *tx, queue_name)
            .await?
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_owned()))?;

        let stats = tasks::queue_stats(&mut *tx, queue.id).await?;
        let latest = metrics::latest(&mut *tx, queue.id).await?;
        let last_processed_at = tasks::last_completed_at(&mut *tx, queue.id).await?;
        let overdue_count = tasks::overdue_count(&mut *tx, queue.id).await?;

        tx.commit().await?;

        let avg_processing_time = latest
            .and_then(|m| m.avg_processing_time)
            .unwrap_or(0.0);

        Ok(derive_queue_health(
            &queue.name,
            stats,
            avg_processing_time,
            last_processed_at,
            overdue_count,
            Utc::now(),
            &self.config.monitor,
        ))
    }

    pub async fn list_queues(&self) -> Result<Vec<Queue>> {
        Ok(queues::all(self.store.pool()).await?)
    }

    pub async fn create_queue(&self, new_queue: NewQueue) -> Result<Queue> {
        let queue = queues::create(self.store.pool(), &new_queue)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Error::InvalidSubmission(format!("queue '{}' already exists", new_queue.name))
                }
                _ => Error::from(e),
            })?;

        let _ = audit::record(
            self.store.pool(),
            "queue_created",
            Some("queue"),
            Some(&queue.name),
            "create",
            queue.description.as_deref(),
            Some(&json!({ "priority": queue.priority, "max_workers": queue.max_workers })),
        )
        .await;

        tracing::info!(queue = %queue.name, "queue created");
        Ok(queue)
    }

    pub async fn update_queue(&self, name: &str, update: QueueUpdate) -> Result<Queue> {
        let queue = queues::update(self.store.pool(), name, &update)
            .await?
            .ok_or_else(|| Error::QueueNotFound(name.to_owned()))?;

        let _ = audit::record(
            self.store.pool(),
            "queue_updated",
            Some("queue"),
            Some(&queue.name),
            "update",
            None,
            Some(&json!({ "is_active": queue.is_active, "retry_limit": queue.retry_limit })),
        )
        .await;

        tracing::info!(queue = %queue.name, "queue updated");
        Ok(queue)
    }

    /// The per-queue monitoring loop: one health tick per cadence. A long
    /// tick shortens the following sleep, with a floor of zero.
    pub async fn run_monitor(self: Arc<Self>, shutdown: ShutdownFlag) {
        let _guard = ShutdownGuard::new(&shutdown);
        let mut shutdown_wait = std::pin::pin!(shutdown.wait());
        let interval = self.config.monitor.health_check_interval;

        loop {
            let started = Instant::now();

            if let Err(e) = self.health_tick().await {
                tracing::error!("queue health tick failed: {e}");
            }

            let sleep = interval.saturating_sub(started.elapsed());

            tokio::select! {
                biased;

                _ = shutdown_wait.as_mut() => break,
                _ = tokio::time::sleep(sleep) => (),
            }
        }
    }

    async fn health_tick(&self) -> Result<()> {
        let active = queues::active_all(self.store.pool()).await?;
        let host = host_snapshot().await;

        let observers: Vec<_> = self.observers.read().clone();
        let mut queues_token = HealthStatus::Healthy;

        for queue in &active {
            let health = match self.queue_health(&queue.name).await {
                Ok(health) => health,
                Err(e) => {
                    tracing::error!(queue = %queue.name, "queue health check failed: {e}");
                    continue;
                }
            };

            if !health.is_healthy {
                queues_token = HealthStatus::Degraded;
            }

            for observer in &observers {
                observer.observe(&health).await;
            }

            if let Err(e) = self.store_metrics(queue.id, &health, &host).await {
                tracing::error!(queue = %queue.name, "failed to store queue metrics: {e}");
            }
        }

        let (total, active_count) = queues::counts(self.store.pool()).await?;
        if let Err(e) =
            status::update_queue_health(self.store.pool(), queues_token, total, active_count).await
        {
            tracing::error!("failed to update queue health token: {e}");
        }

        Ok(())
    }

    async fn store_metrics(
        &self,
        queue_id: i32,
        health: &QueueHealth,
        host: &HostSnapshot,
    ) -> sqlx::Result<()> {
        let (avg, min, max) = tasks::processing_time_stats(self.store.pool(), queue_id).await?;

        metrics::insert(
            self.store.pool(),
            &metrics::NewMetrics {
                queue_id,
                pending_count: health.pending_count as i32,
                processing_count: health.processing_count as i32,
                completed_count: health.completed_count as i32,
                failed_count: health.failed_count as i32,
                avg_processing_time: avg,
                min_processing_time: min,
                max_processing_time: max,
                cpu_usage: Some(host.cpu_percent),
                memory_usage: Some(host.memory_percent),
                disk_usage: Some(host.disk_percent),
                error_rate: health.error_rate,
                success_rate: 100.0 - health.error_rate,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> MonitorConfig {
        Config::default().monitor
    }

    fn stats(pending: i64, processing: i64, completed: i64, failed: i64) -> QueueStats {
        QueueStats {
            total: pending + processing + completed + failed,
            pending,
            processing,
            completed,
            failed,
        }
    }

    #[test]
    fn a_quiet_queue_is_healthy() {
        let health = derive_queue_health(
            "default",
            stats(3, 1, 50, 0),
            0.8,
            Some(Utc::now()),
            0,
            Utc::now(),
            &config(),
        );

        assert!(health.is_healthy);
        assert!(health.issues.is_empty());
        assert_eq!(health.error_rate, 0.0);
        assert_eq!(health.avg_processing_time, 0.8);
    }

    #[test]
    fn backup_over_threshold_is_flagged() {
        let health = derive_queue_health(
            "default",
            stats(101, 0, 0, 0),
            0.0,
            None,
            0,
            Utc::now(),
            &config(),
        );

        assert!(!health.is_healthy);
        assert_eq!(health.issues, vec!["Queue backup: 101 pending tasks"]);
    }

    #[test]
    fn error_rate_is_a_percentage_of_processed_tasks() {
        let health = derive_queue_health(
            "default",
            stats(0, 0, 50, 50),
            0.0,
            None,
            0,
            Utc::now(),
            &config(),
        );

        assert_eq!(health.error_rate, 50.0);
        assert_eq!(health.issues, vec!["High error rate: 50.0%"]);
    }

    #[test]
    fn zero_processed_tasks_means_zero_error_rate() {
        let health = derive_queue_health(
            "default",
            stats(5, 2, 0, 0),
            0.0,
            None,
            0,
            Utc::now(),
            &config(),
        );

        assert_eq!(health.error_rate, 0.0);
        assert!(health.is_healthy);
    }

    #[test]
    fn stalled_processing_is_flagged() {
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(600);

        let health = derive_queue_health(
            "default",
            stats(0, 0, 10, 0),
            0.0,
            Some(last),
            0,
            now,
            &config(),
        );

        assert!(!health.is_healthy);
        assert_eq!(
            health.issues,
            vec!["Processing timeout: no completions for 600 seconds"]
        );
    }

    #[test]
    fn overdue_tasks_are_flagged() {
        let health = derive_queue_health(
            "default",
            stats(0, 2, 10, 0),
            0.0,
            Some(Utc::now()),
            2,
            Utc::now(),
            &config(),
        );

        assert!(!health.is_healthy);
        assert_eq!(health.issues, vec!["2 overdue tasks"]);
    }

    #[test]
    fn issues_accumulate() {
        let mut config = config();
        config.processing_timeout = Duration::from_secs(60);

        let now = Utc::now();
        let health = derive_queue_health(
            "default",
            stats(200, 1, 5, 5),
            0.0,
            Some(now - chrono::Duration::seconds(120)),
            1,
            now,
            &config,
        );

        assert!(!health.is_healthy);
        assert_eq!(health.issues.len(), 4);
    }
}
