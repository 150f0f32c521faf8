//! Component health probing result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "health_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a single probed subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub details: Value,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            response_time_ms: None,
            last_check: Some(Utc::now()),
            error_message: None,
            details: Value::Null,
        }
    }

    pub fn failed(name: impl Into<String>, status: HealthStatus, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            response_time_ms: None,
            last_check: Some(Utc::now()),
            error_message: Some(error.into()),
            details: Value::Null,
        }
    }

    pub fn with_response_time(mut self, elapsed: std::time::Duration) -> Self {
        self.response_time_ms = Some(elapsed.as_secs_f64() * 1000.0);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// The aggregate of one component health sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub overall_status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub total_checks: usize,
    pub healthy_components: usize,
    pub degraded_components: usize,
    pub critical_components: usize,
    pub system_metrics: Value,
}

impl SystemHealthReport {
    /// Build a report from probe results, computing the overall status and
    /// severity counts.
    pub fn from_components(
        components: Vec<ComponentHealth>,
        uptime_seconds: f64,
        system_metrics: Value,
    ) -> Self {
        let overall_status = overall_status(&components);
        let count = |status| components.iter().filter(|c| c.status == status).count();

        Self {
            overall_status,
            total_checks: components.len(),
            healthy_components: count(HealthStatus::Healthy),
            degraded_components: count(HealthStatus::Degraded),
            critical_components: count(HealthStatus::Critical),
            components,
            timestamp: Utc::now(),
            uptime_seconds,
            system_metrics,
        }
    }
}

/// Overall status composition: critical dominates, then degraded; healthy
/// only when every component is healthy.
pub fn overall_status(components: &[ComponentHealth]) -> HealthStatus {
    if components.iter().any(|c| c.status == HealthStatus::Critical) {
        HealthStatus::Critical
    } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else if !components.is_empty()
        && components.iter().all(|c| c.status == HealthStatus::Healthy)
    {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(status: HealthStatus) -> ComponentHealth {
        ComponentHealth {
            name: "c".into(),
            status,
            response_time_ms: None,
            last_check: None,
            error_message: None,
            details: Value::Null,
        }
    }

    #[test]
    fn critical_component_dominates() {
        let components = vec![
            component(HealthStatus::Healthy),
            component(HealthStatus::Degraded),
            component(HealthStatus::Critical),
        ];
        assert_eq!(overall_status(&components), HealthStatus::Critical);
    }

    #[test]
    fn degraded_without_critical() {
        let components = vec![component(HealthStatus::Healthy), component(HealthStatus::Degraded)];
        assert_eq!(overall_status(&components), HealthStatus::Degraded);
    }

    #[test]
    fn all_healthy() {
        let components = vec![component(HealthStatus::Healthy), component(HealthStatus::Healthy)];
        assert_eq!(overall_status(&components), HealthStatus::Healthy);
    }

    #[test]
    fn unknown_component_prevents_healthy() {
        let components = vec![component(HealthStatus::Healthy), component(HealthStatus::Unknown)];
        assert_eq!(overall_status(&components), HealthStatus::Unknown);
        assert_eq!(overall_status(&[]), HealthStatus::Unknown);
    }

    #[test]
    fn report_counts_by_severity() {
        let report = SystemHealthReport::from_components(
            vec![
                component(HealthStatus::Healthy),
                component(HealthStatus::Healthy),
                component(HealthStatus::Degraded),
                component(HealthStatus::Critical),
            ],
            12.5,
            Value::Null,
        );

        assert_eq!(report.overall_status, HealthStatus::Critical);
        assert_eq!(report.total_checks, 4);
        assert_eq!(report.healthy_components, 2);
        assert_eq!(report.degraded_components, 1);
        assert_eq!(report.critical_components, 1);
    }
}
