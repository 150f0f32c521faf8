//! Response shapes, kept bit-compatible with the service's published API.

use chrono::{DateTime, Utc};
use foreman_core::health::{ComponentHealth, SystemHealthReport};
use foreman_core::model::{QueueHealth, SystemAlarm};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
pub struct QueueHealthResponse {
    pub queue_name: String,
    pub is_healthy: bool,
    pub pending_count: i64,
    pub processing_count: i64,
    pub failed_count: i64,
    pub error_rate: f64,
    pub avg_processing_time: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
}

impl From<QueueHealth> for QueueHealthResponse {
    fn from(health: QueueHealth) -> Self {
        Self {
            queue_name: health.queue_name,
            is_healthy: health.is_healthy,
            pending_count: health.pending_count,
            processing_count: health.processing_count,
            failed_count: health.failed_count,
            error_rate: health.error_rate,
            avg_processing_time: health.avg_processing_time,
            last_processed_at: health.last_processed_at,
            issues: health.issues,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AlarmResponse {
    pub id: i32,
    pub alarm_type: String,
    pub severity: String,
    pub title: String,
    pub description: Option<String>,
    pub component: Option<String>,
    pub queue_name: Option<String>,
    pub is_active: bool,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub occurrence_count: i32,
    pub context_data: Option<Value>,
    pub tags: Option<Value>,
}

impl From<SystemAlarm> for AlarmResponse {
    fn from(alarm: SystemAlarm) -> Self {
        Self {
            id: alarm.id,
            alarm_type: alarm.alarm_type.as_str().to_owned(),
            severity: alarm.severity.as_str().to_owned(),
            title: alarm.title,
            description: alarm.description,
            component: alarm.component,
            queue_name: alarm.queue_name,
            is_active: alarm.is_active,
            acknowledged: alarm.acknowledged,
            acknowledged_by: alarm.acknowledged_by,
            triggered_at: alarm.triggered_at,
            occurrence_count: alarm.occurrence_count,
            context_data: alarm.context_data,
            tags: alarm.tags.map(|tags| json!(tags.0)),
        }
    }
}

pub fn component_json(component: &ComponentHealth) -> Value {
    json!({
        "name": component.name,
        "status": component.status.as_str(),
        "response_time_ms": component.response_time_ms,
        "last_check": component.last_check,
        "error_message": component.error_message,
        "details": if component.details.is_null() { json!({}) } else { component.details.clone() },
    })
}

pub fn health_report_json(report: &SystemHealthReport) -> Value {
    json!({
        "overall_status": report.overall_status.as_str(),
        "components": report.components.iter().map(component_json).collect::<Vec<_>>(),
        "timestamp": report.timestamp,
        "uptime_seconds": report.uptime_seconds,
        "summary": {
            "total_checks": report.total_checks,
            "healthy_components": report.healthy_components,
            "degraded_components": report.degraded_components,
            "critical_components": report.critical_components,
        },
        "system_metrics": report.system_metrics,
    })
}
