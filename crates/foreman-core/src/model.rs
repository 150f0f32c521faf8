//! Persistent entities and the value types derived from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// Transitions follow `pending -> processing -> {completed | failed |
/// retrying | cancelled}` with `retrying -> processing` on the next
/// attempt. The three terminal states are never left once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` into `next` is permitted.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed | Failed | Retrying) => true,
            (Retrying, Processing | Failed) => true,
            // External cancellation is allowed from any non-terminal state.
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Priority attached to queues and individual submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "queue_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl QueuePriority {
    /// The dense integer value used on the broker wire.
    pub fn broker_value(self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A named logical stream of tasks with its own concurrency and retry
/// defaults.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Queue {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub priority: QueuePriority,
    pub is_active: bool,
    pub max_workers: i32,
    pub retry_limit: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work with a durable identity and a lifecycle state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub queue_id: i32,

    pub task_type: String,
    pub task_name: String,
    pub payload: Option<Value>,
    pub result: Option<Value>,

    pub status: TaskStatus,
    pub priority: QueuePriority,
    pub retry_count: i32,
    pub max_retries: i32,

    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,

    pub correlation_id: Option<String>,
    /// Execution id assigned by the broker at submit time.
    pub worker_id: Option<String>,
    pub tags: Option<Json<HashMap<String, String>>>,
}

impl Task {
    /// Wall-clock duration of the task, available once it has both started
    /// and reached a terminal state.
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// A task is overdue while it is processing past its timeout deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.timeout_at.map(|t| now > t).unwrap_or(false)
    }
}

/// One metrics sample per queue per health tick. Append-only.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueMetrics {
    pub id: i64,
    pub queue_id: i32,
    pub timestamp: DateTime<Utc>,

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

/// Per-queue health derived from the store on every monitoring tick.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue_name: String,
    pub is_healthy: bool,
    pub pending_count: i64,
    pub processing_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    /// Percentage of failed tasks among all processed ones.
    pub error_rate: f64,
    pub avg_processing_time: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
}

/// A request to place a task onto a queue.
///
/// `timeout_seconds` and `retry_limit` fall back to the queue row's
/// defaults when left unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_type: String,
    pub task_name: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: QueuePriority,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
    #[serde(default)]
    pub retry_limit: Option<i32>,
}

fn default_queue_name() -> String {
    "default".to_owned()
}

impl TaskSubmission {
    pub fn new(task_type: impl Into<String>, task_name: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            task_name: task_name.into(),
            payload,
            priority: QueuePriority::Normal,
            queue_name: default_queue_name(),
            correlation_id: None,
            scheduled_at: None,
            timeout_seconds: None,
            tags: None,
            retry_limit: None,
        }
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// A persisted system alarm. See [`crate::alarm`] for the event side.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SystemAlarm {
    pub id: i32,

    pub alarm_type: crate::alarm::AlarmType,
    pub severity: crate::alarm::AlarmSeverity,
    pub title: String,
    pub description: Option<String>,

    pub queue_name: Option<String>,
    pub task_id: Option<Uuid>,
    pub component: Option<String>,

    pub is_active: bool,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,

    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_occurrence: DateTime<Utc>,

    pub occurrence_count: i32,
    pub context_data: Option<Value>,
    pub tags: Option<Json<HashMap<String, String>>>,
}

/// The singleton system status row, updated by the health monitor and the
/// shutdown controller.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SystemStatus {
    pub id: i32,

    pub is_operational: bool,
    pub is_maintenance_mode: bool,
    pub shutdown_requested: bool,
    pub shutdown_reason: Option<String>,

    pub overall_health: crate::health::HealthStatus,
    pub queue_health: crate::health::HealthStatus,
    pub database_health: crate::health::HealthStatus,
    pub broker_health: crate::health::HealthStatus,

    pub total_queues: i32,
    pub active_queues: i32,

    pub last_updated: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub uptime_started: DateTime<Utc>,

    pub version: Option<String>,
    pub environment: Option<String>,
}

/// An audit trail entry for administrative actions.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLog {
    pub id: i64,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sinks() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Retrying,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} should be rejected"
                );
            }
        }
    }

    #[test]
    fn lifecycle_permits_the_documented_path() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn priority_maps_to_dense_broker_values() {
        assert_eq!(QueuePriority::Low.broker_value(), 1);
        assert_eq!(QueuePriority::Normal.broker_value(), 5);
        assert_eq!(QueuePriority::High.broker_value(), 8);
        assert_eq!(QueuePriority::Critical.broker_value(), 10);
    }

    #[test]
    fn duration_requires_both_timestamps() {
        let now = Utc::now();
        let mut task = sample_task(now);
        assert_eq!(task.duration_seconds(), None);

        task.started_at = Some(now);
        assert_eq!(task.duration_seconds(), None);

        task.completed_at = Some(now + chrono::Duration::milliseconds(1500));
        assert_eq!(task.duration_seconds(), Some(1.5));
    }

    #[test]
    fn overdue_requires_processing_state() {
        let now = Utc::now();
        let mut task = sample_task(now);
        task.timeout_at = Some(now - chrono::Duration::seconds(1));

        task.status = TaskStatus::Pending;
        assert!(!task.is_overdue(now));

        task.status = TaskStatus::Processing;
        assert!(task.is_overdue(now));

        task.timeout_at = Some(now + chrono::Duration::seconds(60));
        assert!(!task.is_overdue(now));
    }

    fn sample_task(now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            queue_id: 1,
            task_type: "noop".into(),
            task_name: "t".into(),
            payload: None,
            result: None,
            status: TaskStatus::Pending,
            priority: QueuePriority::Normal,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            error_traceback: None,
            last_error_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            scheduled_at: now,
            timeout_at: None,
            correlation_id: None,
            worker_id: None,
            tags: None,
        }
    }
}
