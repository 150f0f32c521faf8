//! Periodic component health evaluation.
//!
//! Four probes run concurrently with per-call deadlines: the store, the
//! broker (live workers + registered handlers), host resources, and an
//! optional external endpoint. The aggregate report is persisted to the
//! system status row; critical components raise alarms from the
//! monitoring loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};
use foreman_core::health::{ComponentHealth, HealthStatus, SystemHealthReport};
use foreman_core::{Config, MonitorConfig};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::alarm::AlarmEngine;
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::registry::TaskRegistry;
use crate::store::{queues, status, Store};

/// Resource usage beyond these bounds is critical regardless of the
/// configured warning thresholds.
const CPU_CRITICAL: f64 = 95.0;
const MEMORY_CRITICAL: f64 = 95.0;
const DISK_CRITICAL: f64 = 98.0;

const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// A worker whose heartbeat is older than this does not count as live for
/// the broker probe. Matches the worker-side expiry window.
const WORKER_LIVENESS_WINDOW: Duration = Duration::from_secs(120);

/// A point-in-time sample of host resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_average: (f64, f64, f64),
    pub cpu_count: usize,
    pub process_count: usize,
    pub memory_total_gb: f64,
    pub disk_total_gb: f64,
}

/// Sample the host. Runs on the blocking pool since sysinfo needs a short
/// settle interval between CPU refreshes.
pub async fn host_snapshot() -> HostSnapshot {
    tokio::task::spawn_blocking(|| {
        let mut system = sysinfo::System::new_all();
        system.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();

        let memory_percent = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (disk_percent, disk_total) = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space() - d.available_space();
                (used as f64 / d.total_space() as f64 * 100.0, d.total_space())
            })
            .fold((0.0f64, 0u64), |(max_pct, total), (pct, space)| {
                (max_pct.max(pct), total.max(space))
            });

        let load = sysinfo::System::load_average();

        HostSnapshot {
            cpu_percent: system.global_cpu_usage() as f64,
            memory_percent,
            disk_percent,
            load_average: (load.one, load.five, load.fifteen),
            cpu_count: system.cpus().len(),
            process_count: system.processes().len(),
            memory_total_gb: system.total_memory() as f64 / 1024f64.powi(3),
            disk_total_gb: disk_total as f64 / 1024f64.powi(3),
        }
    })
    .await
    .unwrap_or_default()
}

/// Classify a host snapshot against the configured thresholds.
///
/// Exceeding a warning threshold degrades the component; passing the fixed
/// critical bounds (95/95/98) makes it critical. Every exceeded threshold
/// contributes an issue line.
pub(crate) fn classify_resources(
    snapshot: &HostSnapshot,
    config: &MonitorConfig,
) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    let mut check = |value: f64, warn: f64, critical: f64, label: &str| {
        if value > warn {
            let level = if value < critical {
                HealthStatus::Degraded
            } else {
                HealthStatus::Critical
            };
            status = status.max_severity(level);
            issues.push(format!("High {label} usage: {value:.1}%"));
        }
    };

    check(snapshot.cpu_percent, config.cpu_threshold as f64, CPU_CRITICAL, "CPU");
    check(
        snapshot.memory_percent,
        config.memory_threshold as f64,
        MEMORY_CRITICAL,
        "memory",
    );
    check(snapshot.disk_percent, config.disk_threshold as f64, DISK_CRITICAL, "disk");

    (status, issues)
}

trait MaxSeverity {
    fn max_severity(self, other: HealthStatus) -> HealthStatus;
}

impl MaxSeverity for HealthStatus {
    fn max_severity(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Critical, _) | (_, HealthStatus::Critical) => HealthStatus::Critical,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            (HealthStatus::Healthy, s) | (s, HealthStatus::Healthy) => s,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Map an HTTP response code from the external probe to a health status.
pub(crate) fn classify_http_status(code: u16) -> (HealthStatus, Option<String>) {
    match code {
        100..=399 => (HealthStatus::Healthy, None),
        400..=499 => (HealthStatus::Degraded, Some(format!("Client error: {code}"))),
        _ => (HealthStatus::Critical, Some(format!("Server error: {code}"))),
    }
}

pub struct HealthMonitor {
    store: Store,
    registry: Arc<TaskRegistry>,
    config: Config,
    http: reqwest::Client,
    started: Instant,
    last_report: parking_lot::RwLock<Option<SystemHealthReport>>,
}

impl HealthMonitor {
    pub fn new(store: Store, registry: Arc<TaskRegistry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config,
            http: reqwest::Client::new(),
            started: Instant::now(),
            last_report: parking_lot::RwLock::new(None),
        }
    }

    /// The report produced by the most recent sweep, if any.
    pub fn last_report(&self) -> Option<SystemHealthReport> {
        self.last_report.read().clone()
    }

    /// Run all probes concurrently and persist the aggregate to the
    /// system status row.
    pub async fn perform_check(&self) -> anyhow::Result<SystemHealthReport> {
        let (store, broker, resources, external) = tokio::join!(
            probe_with_deadline("database", self.check_store()),
            probe_with_deadline("broker", self.check_broker()),
            probe_with_deadline("system_resources", self.check_resources()),
            probe_with_deadline("external_services", self.check_external()),
        );

        let database_health = store.status;
        let broker_health = broker.status;

        let snapshot = host_snapshot().await;
        let components = vec![store, broker, resources, external];
        let report = SystemHealthReport::from_components(
            components,
            self.started.elapsed().as_secs_f64(),
            json!({
                "cpu_count": snapshot.cpu_count,
                "memory_total_gb": snapshot.memory_total_gb,
                "disk_total_gb": snapshot.disk_total_gb,
                "load_average_1m": snapshot.load_average.0,
                "load_average_5m": snapshot.load_average.1,
                "load_average_15m": snapshot.load_average.2,
            }),
        );

        if let Err(e) = status::update_health(
            self.store.pool(),
            report.overall_status,
            database_health,
            broker_health,
            report.timestamp,
        )
        .await
        {
            tracing::error!("failed to persist system status: {e}");
        }

        *self.last_report.write() = Some(report.clone());

        tracing::info!(
            overall = %report.overall_status,
            healthy = report.healthy_components,
            degraded = report.degraded_components,
            critical = report.critical_components,
            "health check completed"
        );

        Ok(report)
    }

    /// The monitoring loop: one sweep per cadence, with critical
    /// components escalated to the alarm engine.
    pub async fn run(self: Arc<Self>, alarms: Arc<AlarmEngine>, shutdown: ShutdownFlag) {
        let _guard = ShutdownGuard::new(&shutdown);
        let mut shutdown_wait = std::pin::pin!(shutdown.wait());
        let interval = self.config.monitor.component_check_interval;

        loop {
            let started = Instant::now();

            match self.perform_check().await {
                Ok(report) => self.emit_critical_alarms(&report, &alarms).await,
                Err(e) => tracing::error!("component health sweep failed: {e:#}"),
            }

            // A long sweep shortens the following sleep, with a floor of
            // zero; iterations never overlap.
            let sleep = interval.saturating_sub(started.elapsed());

            tokio::select! {
                biased;

                _ = shutdown_wait.as_mut() => break,
                _ = tokio::time::sleep(sleep) => (),
            }
        }
    }

    async fn emit_critical_alarms(&self, report: &SystemHealthReport, alarms: &AlarmEngine) {
        for component in &report.components {
            if component.status != HealthStatus::Critical {
                continue;
            }

            let error = component.error_message.as_deref().unwrap_or("unknown failure");
            let event = if component.name == "system_resources" {
                AlarmEvent::new(
                    AlarmType::ResourceExhaustion,
                    AlarmSeverity::Critical,
                    "System Resource Exhaustion",
                    format!("System resources are critically low: {error}"),
                )
                .for_component("system_resources")
                .with_context(component.details.clone())
            } else {
                AlarmEvent::new(
                    AlarmType::SystemError,
                    AlarmSeverity::Critical,
                    format!("Critical Component Failure: {}", component.name),
                    format!("Component '{}' is in critical state: {error}", component.name),
                )
                .for_component(&component.name)
                .with_context(json!({
                    "component": component.name,
                    "error_message": component.error_message,
                    "response_time_ms": component.response_time_ms,
                }))
            };

            if let Err(e) = alarms.trigger(event).await {
                tracing::error!(component = %component.name, "failed to trigger alarm: {e}");
            }
        }
    }

    async fn check_store(&self) -> ComponentHealth {
        let started = Instant::now();
        let pool = self.store.pool();

        let result = async {
            sqlx::query("SELECT 1").execute(pool).await?;
            queues::count(pool).await
        }
        .await;

        match result {
            Ok(queue_count) => ComponentHealth::healthy("database")
                .with_response_time(started.elapsed())
                .with_details(json!({
                    "queue_count": queue_count,
                    "pool_size": pool.size(),
                    "pool_idle": pool.num_idle(),
                })),
            Err(e) => ComponentHealth::failed("database", HealthStatus::Critical, e.to_string())
                .with_response_time(started.elapsed()),
        }
    }

    async fn check_broker(&self) -> ComponentHealth {
        let started = Instant::now();

        let timeout_secs = WORKER_LIVENESS_WINDOW.as_secs_f64();
        let live_workers = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM workers
              WHERE CURRENT_TIMESTAMP - heartbeat_at <= make_interval(secs => $1)",
        )
        .bind(timeout_secs)
        .fetch_one(self.store.pool())
        .await;

        let registered: Vec<String> = self
            .registry
            .registered_types()
            .into_iter()
            .map(str::to_owned)
            .collect();

        match live_workers {
            Ok(0) => {
                ComponentHealth::failed("broker", HealthStatus::Critical, "No active workers found")
                    .with_response_time(started.elapsed())
            }
            Ok(count) if registered.is_empty() => ComponentHealth::failed(
                "broker",
                HealthStatus::Critical,
                "No task handlers registered",
            )
            .with_response_time(started.elapsed())
            .with_details(json!({ "active_workers": count })),
            Ok(count) => ComponentHealth::healthy("broker")
                .with_response_time(started.elapsed())
                .with_details(json!({
                    "active_workers": count,
                    "registered_tasks": registered.len(),
                    "task_types": registered,
                })),
            Err(e) => ComponentHealth::failed("broker", HealthStatus::Critical, e.to_string())
                .with_response_time(started.elapsed()),
        }
    }

    async fn check_resources(&self) -> ComponentHealth {
        let started = Instant::now();
        let snapshot = host_snapshot().await;
        let (status, issues) = classify_resources(&snapshot, &self.config.monitor);

        ComponentHealth {
            name: "system_resources".into(),
            status,
            response_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            last_check: Some(Utc::now()),
            error_message: if issues.is_empty() {
                None
            } else {
                Some(issues.join("; "))
            },
            details: json!({
                "cpu_percent": snapshot.cpu_percent,
                "memory_percent": snapshot.memory_percent,
                "disk_percent": snapshot.disk_percent,
                "load_average_1m": snapshot.load_average.0,
                "process_count": snapshot.process_count,
            }),
        }
    }

    async fn check_external(&self) -> ComponentHealth {
        let started = Instant::now();

        let Some(base_url) = &self.config.monitor.external_base_url else {
            return ComponentHealth {
                name: "external_services".into(),
                status: HealthStatus::Unknown,
                response_time_ms: Some(0.0),
                last_check: Some(Utc::now()),
                error_message: Some("No external services configured".into()),
                details: Value::Null,
            };
        };

        match self.http.get(base_url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let (status, error_message) = classify_http_status(code);

                ComponentHealth {
                    name: "external_services".into(),
                    status,
                    response_time_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                    last_check: Some(Utc::now()),
                    error_message,
                    details: json!({ "status_code": code, "url": base_url }),
                }
            }
            Err(e) => {
                ComponentHealth::failed("external_services", HealthStatus::Critical, e.to_string())
                    .with_response_time(started.elapsed())
            }
        }
    }
}

async fn probe_with_deadline(
    name: &str,
    probe: impl std::future::Future<Output = ComponentHealth>,
) -> ComponentHealth {
    match tokio::time::timeout(PROBE_DEADLINE, probe).await {
        Ok(health) => health,
        Err(_) => ComponentHealth::failed(
            name,
            HealthStatus::Critical,
            format!("health probe timed out after {}s", PROBE_DEADLINE.as_secs()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use foreman_core::MonitorConfig;

    use super::*;

    fn monitor_config() -> MonitorConfig {
        foreman_core::Config::default().monitor
    }

    fn snapshot(cpu: f64, memory: f64, disk: f64) -> HostSnapshot {
        HostSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: disk,
            ..Default::default()
        }
    }

    #[test]
    fn resources_within_thresholds_are_healthy() {
        let (status, issues) = classify_resources(&snapshot(10.0, 40.0, 50.0), &monitor_config());
        assert_eq!(status, HealthStatus::Healthy);
        assert!(issues.is_empty());
    }

    #[test]
    fn exceeding_a_threshold_degrades() {
        let (status, issues) = classify_resources(&snapshot(85.0, 40.0, 50.0), &monitor_config());
        assert_eq!(status, HealthStatus::Degraded);
        assert_eq!(issues, vec!["High CPU usage: 85.0%"]);
    }

    #[test]
    fn passing_the_fixed_bound_is_critical() {
        let (status, issues) = classify_resources(&snapshot(96.0, 96.0, 50.0), &monitor_config());
        assert_eq!(status, HealthStatus::Critical);
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn disk_critical_bound_is_higher() {
        let (status, _) = classify_resources(&snapshot(10.0, 40.0, 97.0), &monitor_config());
        assert_eq!(status, HealthStatus::Degraded);

        let (status, _) = classify_resources(&snapshot(10.0, 40.0, 98.5), &monitor_config());
        assert_eq!(status, HealthStatus::Critical);
    }

    #[test]
    fn http_codes_map_to_health() {
        assert_eq!(classify_http_status(200).0, HealthStatus::Healthy);
        assert_eq!(classify_http_status(302).0, HealthStatus::Healthy);
        assert_eq!(classify_http_status(404).0, HealthStatus::Degraded);
        assert_eq!(classify_http_status(500).0, HealthStatus::Critical);
        assert_eq!(classify_http_status(503).0, HealthStatus::Critical);
    }
}
