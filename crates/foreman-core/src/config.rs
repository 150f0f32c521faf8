//! Environment-driven configuration.
//!
//! Every knob has a hard default so a bare `Config::default()` is a
//! working development configuration; `Config::from_env()` overlays the
//! process environment (and a `.env` file when present) on top of it.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,
    pub log_level: String,
    pub environment: String,

    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub monitor: MonitorConfig,
    pub alarm: AlarmConfig,
    pub alerts: AlertConfig,
    pub api: ApiConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    /// How long to wait for a connection from the pool.
    pub pool_timeout: Duration,
    /// Maximum lifetime of a pooled connection before it is recycled.
    pub pool_recycle: Duration,
}

impl DatabaseConfig {
    /// Total connection budget for the pool.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Concurrent task executions per worker process.
    pub worker_concurrency: usize,
    pub prefetch_multiplier: usize,
    /// Soft per-task execution deadline enforced by the execution wrapper.
    pub soft_time_limit: Duration,
    /// Hard per-task deadline; the handler future is dropped past this.
    pub time_limit: Duration,
    /// Base of the exponential retry backoff.
    pub default_retry_delay: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Cadence of the per-queue health loop.
    pub health_check_interval: Duration,
    /// Cadence of the component probe loop.
    pub component_check_interval: Duration,
    /// A queue with no completions for this long is flagged unhealthy.
    pub processing_timeout: Duration,
    /// Pending-task count above which a queue is considered backed up.
    pub backup_threshold: i64,
    /// Error-rate percentage above which a queue is considered unhealthy.
    pub error_threshold: f64,

    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub disk_threshold: f32,

    /// Base URL probed by the external-services check; unset skips it.
    pub external_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Minimum interval between notifications for the same alarm scope.
    pub cooldown: Duration,
    /// Consecutive unhealthy observations before escalating to critical.
    pub consecutive_failures_threshold: u32,
    /// Whether a critical alarm in the shutdown set triggers an emergency
    /// shutdown.
    pub critical_alarm_shutdown: bool,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub email_recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_token: String,
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_owned(),
            environment: "development".to_owned(),
            database: DatabaseConfig {
                url: "postgresql://localhost:5432/foreman".to_owned(),
                pool_size: 10,
                max_overflow: 20,
                pool_timeout: Duration::from_secs(30),
                pool_recycle: Duration::from_secs(3600),
            },
            broker: BrokerConfig {
                worker_concurrency: 4,
                prefetch_multiplier: 1,
                soft_time_limit: Duration::from_secs(300),
                time_limit: Duration::from_secs(600),
                default_retry_delay: Duration::from_secs(60),
                max_retries: 3,
            },
            monitor: MonitorConfig {
                health_check_interval: Duration::from_secs(30),
                component_check_interval: Duration::from_secs(60),
                processing_timeout: Duration::from_secs(300),
                backup_threshold: 100,
                error_threshold: 10.0,
                cpu_threshold: 80.0,
                memory_threshold: 85.0,
                disk_threshold: 90.0,
                external_base_url: None,
            },
            alarm: AlarmConfig {
                cooldown: Duration::from_secs(300),
                consecutive_failures_threshold: 5,
                critical_alarm_shutdown: true,
            },
            alerts: AlertConfig {
                webhook_url: None,
                smtp_host: "localhost".to_owned(),
                smtp_port: 587,
                smtp_username: None,
                smtp_password: None,
                email_recipients: Vec::new(),
            },
            api: ApiConfig {
                host: "0.0.0.0".to_owned(),
                port: 8001,
                shutdown_token: "emergency-shutdown-token".to_owned(),
                allow_origins: vec!["*".to_owned()],
            },
            dashboard: DashboardConfig {
                host: "0.0.0.0".to_owned(),
                port: 8000,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables, reading a `.env`
    /// file first when one exists.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        config.debug = env_parse("DEBUG", config.debug);
        config.log_level = env_or("LOG_LEVEL", &config.log_level);
        config.environment = env_or("ENVIRONMENT", &config.environment);

        config.database.url = env_or("DATABASE_URL", &config.database.url);
        config.database.pool_size = env_parse("DATABASE_POOL_SIZE", config.database.pool_size);
        config.database.max_overflow =
            env_parse("DATABASE_MAX_OVERFLOW", config.database.max_overflow);
        config.database.pool_timeout =
            env_secs("DATABASE_POOL_TIMEOUT", config.database.pool_timeout);
        config.database.pool_recycle =
            env_secs("DATABASE_POOL_RECYCLE", config.database.pool_recycle);

        config.broker.worker_concurrency =
            env_parse("WORKER_CONCURRENCY", config.broker.worker_concurrency);
        config.broker.prefetch_multiplier =
            env_parse("WORKER_PREFETCH_MULTIPLIER", config.broker.prefetch_multiplier);
        config.broker.soft_time_limit =
            env_secs("TASK_SOFT_TIME_LIMIT", config.broker.soft_time_limit);
        config.broker.time_limit = env_secs("TASK_TIME_LIMIT", config.broker.time_limit);
        config.broker.default_retry_delay =
            env_secs("TASK_DEFAULT_RETRY_DELAY", config.broker.default_retry_delay);
        config.broker.max_retries = env_parse("TASK_MAX_RETRIES", config.broker.max_retries);

        config.monitor.health_check_interval = env_secs(
            "QUEUE_HEALTH_CHECK_INTERVAL",
            config.monitor.health_check_interval,
        );
        config.monitor.component_check_interval = env_secs(
            "COMPONENT_CHECK_INTERVAL",
            config.monitor.component_check_interval,
        );
        config.monitor.processing_timeout =
            env_secs("QUEUE_PROCESSING_TIMEOUT", config.monitor.processing_timeout);
        config.monitor.backup_threshold =
            env_parse("QUEUE_BACKUP_THRESHOLD", config.monitor.backup_threshold);
        config.monitor.error_threshold =
            env_parse("QUEUE_ERROR_THRESHOLD", config.monitor.error_threshold);
        config.monitor.cpu_threshold = env_parse("CPU_THRESHOLD", config.monitor.cpu_threshold);
        config.monitor.memory_threshold =
            env_parse("MEMORY_THRESHOLD", config.monitor.memory_threshold);
        config.monitor.disk_threshold = env_parse("DISK_THRESHOLD", config.monitor.disk_threshold);
        config.monitor.external_base_url = env::var("EXTERNAL_SERVICE_URL").ok();

        config.alarm.cooldown = env_secs("ALARM_COOLDOWN_PERIOD", config.alarm.cooldown);
        config.alarm.consecutive_failures_threshold = env_parse(
            "CONSECUTIVE_FAILURES_THRESHOLD",
            config.alarm.consecutive_failures_threshold,
        );
        config.alarm.critical_alarm_shutdown =
            env_parse("CRITICAL_ALARM_SHUTDOWN", config.alarm.critical_alarm_shutdown);

        config.alerts.webhook_url = env::var("SLACK_WEBHOOK_URL").ok();
        config.alerts.smtp_host = env_or("EMAIL_SMTP_HOST", &config.alerts.smtp_host);
        config.alerts.smtp_port = env_parse("EMAIL_SMTP_PORT", config.alerts.smtp_port);
        config.alerts.smtp_username = env::var("EMAIL_USERNAME").ok();
        config.alerts.smtp_password = env::var("EMAIL_PASSWORD").ok();
        config.alerts.email_recipients = env::var("ALERT_EMAIL_RECIPIENTS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        config.api.host = env_or("API_HOST", &config.api.host);
        config.api.port = env_parse("API_PORT", config.api.port);
        config.api.shutdown_token = env_or("SHUTDOWN_ENDPOINT_TOKEN", &config.api.shutdown_token);
        if let Ok(origins) = env::var("API_ALLOW_ORIGINS") {
            config.api.allow_origins = parse_list(&origins);
        }

        config.dashboard.host = env_or("DASHBOARD_HOST", &config.dashboard.host);
        config.dashboard.port = env_parse("DASHBOARD_PORT", config.dashboard.port);

        config
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let config = Config::default();

        assert_eq!(config.monitor.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.monitor.component_check_interval, Duration::from_secs(60));
        assert_eq!(config.monitor.backup_threshold, 100);
        assert_eq!(config.monitor.error_threshold, 10.0);
        assert_eq!(config.alarm.cooldown, Duration::from_secs(300));
        assert_eq!(config.alarm.consecutive_failures_threshold, 5);
        assert!(config.alarm.critical_alarm_shutdown);
        assert_eq!(config.broker.default_retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn recipient_list_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_list("ops@example.com, oncall@example.com ,,"),
            vec!["ops@example.com".to_owned(), "oncall@example.com".to_owned()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn pool_budget_is_size_plus_overflow() {
        let config = Config::default();
        assert_eq!(config.database.max_connections(), 30);
    }
}
