//! The alarm engine: classification, dedup, cooldown, escalation,
//! notification fan-out, and the critical-alarm shutdown path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};
use foreman_core::model::{QueueHealth, SystemAlarm};
use foreman_core::{Config, Result};
use serde_json::json;

use crate::manager::QueueHealthObserver;
use crate::shutdown::ShutdownController;
use crate::store::{alarms, audit, Store};

mod channels;

pub use self::channels::{
    channels_from_config, EmailChannel, NotificationChannel, WebhookChannel,
};

/// Window within which repeat occurrences fold into an existing active
/// alarm row instead of inserting a new one.
const DEDUP_WINDOW: Duration = Duration::from_secs(600);

/// Per-channel deadline for notification delivery.
const NOTIFY_DEADLINE: Duration = Duration::from_secs(10);

/// The in-memory cooldown and escalation tables. Only ever touched under
/// the engine's mutex.
///
/// The cooldown gates notification fan-out alone: every event still
/// reaches the store (folding into an active alarm inside the dedup
/// window) and still advances the consecutive-failure count, so repeat
/// occurrences and escalation are never lost to rate limiting.
#[derive(Default)]
pub(crate) struct DedupState {
    last_alarm_times: HashMap<String, DateTime<Utc>>,
    consecutive_failures: HashMap<String, u32>,
}

impl DedupState {
    /// Notification gate: returns false while the previous notification
    /// for this scope is younger than the cooldown. Records `now` when
    /// the notification is allowed through.
    fn should_notify(&mut self, scope_key: &str, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if let Some(last) = self.last_alarm_times.get(scope_key) {
            let elapsed = now.signed_duration_since(*last);
            if elapsed < chrono::Duration::from_std(cooldown).unwrap_or_default() {
                return false;
            }
        }

        self.last_alarm_times.insert(scope_key.to_owned(), now);
        true
    }

    fn record_failure(&mut self, queue_name: &str) -> u32 {
        let count = self.consecutive_failures.entry(queue_name.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_failures(&mut self, queue_name: &str) {
        self.consecutive_failures.remove(queue_name);
    }
}

/// Classify a queue health issue string into an alarm event, or drop it
/// when the text matches no known condition.
pub(crate) fn classify_issue(
    health: &QueueHealth,
    issue: &str,
    config: &Config,
) -> Option<AlarmEvent> {
    let lowered = issue.to_lowercase();
    let queue = &health.queue_name;

    if lowered.contains("backup") {
        Some(
            AlarmEvent::new(
                AlarmType::QueueBackup,
                AlarmSeverity::Warning,
                format!("Queue Backup Detected: {queue}"),
                format!("Queue '{queue}' has excessive pending tasks. {issue}"),
            )
            .for_queue(queue)
            .with_context(json!({
                "pending_count": health.pending_count,
                "processing_count": health.processing_count,
                "threshold": config.monitor.backup_threshold,
            })),
        )
    } else if lowered.contains("error rate") {
        Some(
            AlarmEvent::new(
                AlarmType::HighErrorRate,
                AlarmSeverity::Error,
                format!("High Error Rate: {queue}"),
                format!("Queue '{queue}' has high error rate. {issue}"),
            )
            .for_queue(queue)
            .with_context(json!({
                "error_rate": health.error_rate,
                "failed_count": health.failed_count,
                "threshold": config.monitor.error_threshold,
            })),
        )
    } else if lowered.contains("processing") && lowered.contains("timeout") {
        Some(
            AlarmEvent::new(
                AlarmType::ProcessingTimeout,
                AlarmSeverity::Error,
                format!("Processing Timeout: {queue}"),
                format!("Queue '{queue}' has processing timeout. {issue}"),
            )
            .for_queue(queue)
            .with_context(json!({
                "last_processed_at": health.last_processed_at,
                "timeout_threshold": config.monitor.processing_timeout.as_secs(),
            })),
        )
    } else if lowered.contains("overdue") {
        Some(
            AlarmEvent::new(
                AlarmType::OverdueTasks,
                AlarmSeverity::Warning,
                format!("Overdue Tasks: {queue}"),
                format!("Queue '{queue}' has overdue tasks. {issue}"),
            )
            .for_queue(queue)
            .with_context(json!({
                "avg_processing_time": health.avg_processing_time,
            })),
        )
    } else {
        None
    }
}

/// Apply the consecutive-failure escalation to an event.
pub(crate) fn escalate(event: &mut AlarmEvent, failures: u32) {
    event.severity = AlarmSeverity::Critical;
    event.title = format!("CRITICAL: {}", event.title);
    event
        .description
        .push_str(&format!("\n\nConsecutive failures: {failures}"));
}

pub struct AlarmEngine {
    store: Store,
    config: Config,
    channels: Vec<Arc<dyn NotificationChannel>>,
    state: parking_lot::Mutex<DedupState>,
    shutdown: Arc<ShutdownController>,
}

impl AlarmEngine {
    pub fn new(
        store: Store,
        config: Config,
        channels: Vec<Arc<dyn NotificationChannel>>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            store,
            config,
            channels,
            state: parking_lot::Mutex::new(DedupState::default()),
            shutdown,
        }
    }

    /// Trigger an alarm: persist (with the dedup window), fan out
    /// notifications, and escalate to shutdown when warranted. Returns the
    /// persisted alarm id.
    pub async fn trigger(&self, event: AlarmEvent) -> Result<i32> {
        tracing::info!(
            alarm_type = event.alarm_type.as_str(),
            severity = event.severity.as_str(),
            queue = event.queue_name.as_deref().unwrap_or("-"),
            "triggering alarm: {}",
            event.title
        );

        let alarm_id = self.persist(&event).await?;

        let notify_allowed = self.state.lock().should_notify(
            &event.scope_key(),
            Utc::now(),
            self.config.alarm.cooldown,
        );

        if notify_allowed {
            self.notify_channels(&event, alarm_id).await;
        } else {
            tracing::debug!(
                alarm_id,
                scope = %event.scope_key(),
                "notification suppressed by cooldown"
            );
        }

        if event.severity == AlarmSeverity::Critical
            && event.alarm_type.triggers_shutdown()
            && self.config.alarm.critical_alarm_shutdown
        {
            self.shutdown
                .trigger(&format!("Critical alarm triggered: {}", event.title))
                .await;
        }

        Ok(alarm_id)
    }

    async fn persist(&self, event: &AlarmEvent) -> Result<i32> {
        let mut tx = self.store.begin().await?;

        let window_start =
            Utc::now() - chrono::Duration::from_std(DEDUP_WINDOW).unwrap_or_default();
        let recent = alarms::most_recent(&mut *tx, event.alarm_type, window_start).await?;

        let alarm_id = match recent {
            Some(alarm) if alarm.is_active => {
                alarms::touch(
                    &mut *tx,
                    alarm.id,
                    &event.description,
                    event.context_data.as_ref(),
                    event.severity,
                )
                .await?;
                alarm.id
            }
            _ => alarms::insert(&mut *tx, event).await?.id,
        };

        tx.commit().await?;
        Ok(alarm_id)
    }

    /// Fan out to every channel concurrently. A failing or slow channel is
    /// logged and never affects the others or the trigger itself.
    async fn notify_channels(&self, event: &AlarmEvent, alarm_id: i32) {
        if self.channels.is_empty() {
            return;
        }

        let deliveries = self.channels.iter().map(|channel| {
            let channel = channel.clone();
            async move {
                let result = tokio::time::timeout(NOTIFY_DEADLINE, channel.notify(event, alarm_id)).await;

                match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(channel = channel.name(), alarm_id, "notification failed: {e:#}");
                        false
                    }
                    Err(_) => {
                        tracing::warn!(channel = channel.name(), alarm_id, "notification timed out");
                        false
                    }
                }
            }
        });

        let results = futures_util::future::join_all(deliveries).await;
        let delivered = results.iter().filter(|ok| **ok).count();

        tracing::info!(alarm_id, delivered, total = results.len(), "notifications dispatched");
    }

    pub async fn acknowledge(&self, alarm_id: i32, acknowledged_by: &str) -> Result<bool> {
        let acknowledged =
            alarms::acknowledge(self.store.pool(), alarm_id, acknowledged_by).await?;

        if acknowledged {
            tracing::info!(alarm_id, acknowledged_by, "alarm acknowledged");
            let _ = audit::record(
                self.store.pool(),
                "alarm_acknowledged",
                Some("alarm"),
                Some(&alarm_id.to_string()),
                "acknowledge",
                None,
                Some(&json!({ "acknowledged_by": acknowledged_by })),
            )
            .await;
        }

        Ok(acknowledged)
    }

    pub async fn resolve(&self, alarm_id: i32) -> Result<bool> {
        let resolved = alarms::resolve(self.store.pool(), alarm_id).await?;

        if resolved {
            tracing::info!(alarm_id, "alarm resolved");
            let _ = audit::record(
                self.store.pool(),
                "alarm_resolved",
                Some("alarm"),
                Some(&alarm_id.to_string()),
                "resolve",
                None,
                None,
            )
            .await;
        }

        Ok(resolved)
    }

    pub async fn active_alarms(&self) -> Result<Vec<SystemAlarm>> {
        Ok(alarms::active_all(self.store.pool()).await?)
    }
}

#[async_trait]
impl QueueHealthObserver for AlarmEngine {
    /// Convert queue health findings into alarms. A healthy observation
    /// resets the queue's escalation counter; an unhealthy one advances it
    /// and classifies every issue, escalating each resulting event to
    /// critical once the counter reaches the configured threshold.
    async fn observe(&self, health: &QueueHealth) {
        if health.is_healthy {
            self.state.lock().reset_failures(&health.queue_name);
            return;
        }

        let failures = self.state.lock().record_failure(&health.queue_name);

        for issue in &health.issues {
            let Some(mut event) = classify_issue(health, issue, &self.config) else {
                tracing::debug!(queue = %health.queue_name, issue, "unclassified health issue dropped");
                continue;
            };

            if failures >= self.config.alarm.consecutive_failures_threshold {
                escalate(&mut event, failures);
            }

            if let Err(e) = self.trigger(event).await {
                tracing::error!(queue = %health.queue_name, "failed to trigger alarm: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(issues: &[&str]) -> QueueHealth {
        QueueHealth {
            queue_name: "default".into(),
            is_healthy: issues.is_empty(),
            pending_count: 150,
            processing_count: 2,
            completed_count: 10,
            failed_count: 5,
            error_rate: 33.3,
            avg_processing_time: 1.25,
            last_processed_at: None,
            issues: issues.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn issues_classify_by_substring() {
        let config = Config::default();
        let health = health(&[
            "Queue backup: 150 pending tasks",
            "High error rate: 33.3%",
            "Processing timeout: no completions for 600 seconds",
            "3 overdue tasks",
            "something inscrutable",
        ]);

        let types: Vec<_> = health
            .issues
            .iter()
            .map(|issue| classify_issue(&health, issue, &config).map(|e| e.alarm_type))
            .collect();

        assert_eq!(
            types,
            vec![
                Some(AlarmType::QueueBackup),
                Some(AlarmType::HighErrorRate),
                Some(AlarmType::ProcessingTimeout),
                Some(AlarmType::OverdueTasks),
                None,
            ]
        );
    }

    #[test]
    fn classification_carries_queue_scope_and_severity() {
        let config = Config::default();
        let health = health(&["Queue backup: 150 pending tasks"]);
        let event = classify_issue(&health, &health.issues[0], &config).unwrap();

        assert_eq!(event.queue_name.as_deref(), Some("default"));
        assert_eq!(event.severity, AlarmSeverity::Warning);
        assert_eq!(event.context_data.as_ref().unwrap()["threshold"], 100);

        let health = health_with_error_rate();
        let event = classify_issue(&health, &health.issues[0], &config).unwrap();
        assert_eq!(event.severity, AlarmSeverity::Error);
    }

    fn health_with_error_rate() -> QueueHealth {
        health(&["High error rate: 33.3%"])
    }

    #[test]
    fn cooldown_suppresses_notifications_within_the_window() {
        let mut state = DedupState::default();
        let cooldown = Duration::from_secs(300);
        let t0 = Utc::now();

        assert!(state.should_notify("queue_backup:default", t0, cooldown));
        assert!(!state.should_notify(
            "queue_backup:default",
            t0 + chrono::Duration::seconds(10),
            cooldown
        ));
        assert!(!state.should_notify(
            "queue_backup:default",
            t0 + chrono::Duration::seconds(299),
            cooldown
        ));
        assert!(state.should_notify(
            "queue_backup:default",
            t0 + chrono::Duration::seconds(301),
            cooldown
        ));
    }

    #[test]
    fn cooldown_scopes_are_independent() {
        let mut state = DedupState::default();
        let cooldown = Duration::from_secs(300);
        let t0 = Utc::now();

        assert!(state.should_notify("queue_backup:default", t0, cooldown));
        assert!(state.should_notify("queue_backup:bulk", t0, cooldown));
        assert!(state.should_notify("high_error_rate:default", t0, cooldown));
    }

    #[test]
    fn suppressed_notifications_do_not_block_the_escalation_counter() {
        // The cooldown table and the failure counter are independent: a
        // scope in cooldown keeps counting failures toward escalation.
        let mut state = DedupState::default();
        let cooldown = Duration::from_secs(300);
        let t0 = Utc::now();

        assert!(state.should_notify("high_error_rate:default", t0, cooldown));
        assert_eq!(state.record_failure("default"), 1);

        assert!(!state.should_notify(
            "high_error_rate:default",
            t0 + chrono::Duration::seconds(30),
            cooldown
        ));
        assert_eq!(state.record_failure("default"), 2);
        assert_eq!(state.record_failure("default"), 3);
    }

    #[test]
    fn consecutive_failures_count_and_reset() {
        let mut state = DedupState::default();

        assert_eq!(state.record_failure("default"), 1);
        assert_eq!(state.record_failure("default"), 2);
        assert_eq!(state.record_failure("bulk"), 1);

        state.reset_failures("default");
        assert_eq!(state.record_failure("default"), 1);
        assert_eq!(state.record_failure("bulk"), 2);
    }

    #[test]
    fn escalation_rewrites_severity_title_and_description() {
        let mut event = AlarmEvent::new(
            AlarmType::HighErrorRate,
            AlarmSeverity::Error,
            "High Error Rate: default",
            "Queue 'default' has high error rate.",
        );

        escalate(&mut event, 5);

        assert_eq!(event.severity, AlarmSeverity::Critical);
        assert_eq!(event.title, "CRITICAL: High Error Rate: default");
        assert!(event.description.ends_with("Consecutive failures: 5"));
    }
}
