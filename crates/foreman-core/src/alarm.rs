//! Alarm event types shared between the engine and its consumers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alarm_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    QueueBackup,
    HighErrorRate,
    ProcessingTimeout,
    OverdueTasks,
    SystemError,
    DatabaseError,
    ResourceExhaustion,
    SystemShutdown,
}

impl AlarmType {
    /// Whether a critical alarm of this type participates in the emergency
    /// shutdown escalation.
    pub fn triggers_shutdown(self) -> bool {
        matches!(
            self,
            Self::HighErrorRate
                | Self::ProcessingTimeout
                | Self::SystemError
                | Self::DatabaseError
                | Self::ResourceExhaustion
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueBackup => "queue_backup",
            Self::HighErrorRate => "high_error_rate",
            Self::ProcessingTimeout => "processing_timeout",
            Self::OverdueTasks => "overdue_tasks",
            Self::SystemError => "system_error",
            Self::DatabaseError => "database_error",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::SystemShutdown => "system_shutdown",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
    Default,
)]
#[sqlx(type_name = "alarm_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

impl AlarmSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// An alarm occurrence before persistence and fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmEvent {
    pub alarm_type: AlarmType,
    pub severity: AlarmSeverity,
    pub title: String,
    pub description: String,
    pub queue_name: Option<String>,
    pub task_id: Option<Uuid>,
    pub component: Option<String>,
    pub context_data: Option<Value>,
    pub tags: Option<HashMap<String, String>>,
    pub auto_resolve: bool,
    pub requires_acknowledgment: bool,
}

impl AlarmEvent {
    pub fn new(
        alarm_type: AlarmType,
        severity: AlarmSeverity,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            alarm_type,
            severity,
            title: title.into(),
            description: description.into(),
            queue_name: None,
            task_id: None,
            component: None,
            context_data: None,
            tags: None,
            auto_resolve: false,
            requires_acknowledgment: false,
        }
    }

    pub fn for_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn for_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context_data = Some(context);
        self
    }

    /// Dedup/cooldown key: alarm type scoped by queue, falling back to the
    /// whole system.
    pub fn scope_key(&self) -> String {
        format!(
            "{}:{}",
            self.alarm_type.as_str(),
            self.queue_name.as_deref().unwrap_or("system")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_set_matches_the_documented_types() {
        assert!(AlarmType::HighErrorRate.triggers_shutdown());
        assert!(AlarmType::ProcessingTimeout.triggers_shutdown());
        assert!(AlarmType::SystemError.triggers_shutdown());
        assert!(AlarmType::DatabaseError.triggers_shutdown());
        assert!(AlarmType::ResourceExhaustion.triggers_shutdown());

        assert!(!AlarmType::QueueBackup.triggers_shutdown());
        assert!(!AlarmType::OverdueTasks.triggers_shutdown());
        assert!(!AlarmType::SystemShutdown.triggers_shutdown());
    }

    #[test]
    fn scope_key_distinguishes_queue_and_system_alarms() {
        let queue_event = AlarmEvent::new(
            AlarmType::QueueBackup,
            AlarmSeverity::Warning,
            "t",
            "d",
        )
        .for_queue("default");
        assert_eq!(queue_event.scope_key(), "queue_backup:default");

        let system_event =
            AlarmEvent::new(AlarmType::SystemError, AlarmSeverity::Error, "t", "d");
        assert_eq!(system_event.scope_key(), "system_error:system");
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(AlarmSeverity::Info < AlarmSeverity::Warning);
        assert!(AlarmSeverity::Warning < AlarmSeverity::Error);
        assert!(AlarmSeverity::Error < AlarmSeverity::Critical);
    }
}
