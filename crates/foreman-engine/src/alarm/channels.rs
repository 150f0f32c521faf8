//! Notification channels for alarm fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use foreman_core::alarm::{AlarmEvent, AlarmSeverity};
use foreman_core::AlertConfig;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Value};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &AlarmEvent, alarm_id: i32) -> anyhow::Result<()>;
}

/// Build the channel set from the alerts configuration. Channels whose
/// settings are absent are simply not installed.
pub fn channels_from_config(config: &AlertConfig) -> Vec<Arc<dyn NotificationChannel>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    if let Some(url) = &config.webhook_url {
        channels.push(Arc::new(WebhookChannel::new(url.clone())));
    }

    if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
        if !config.email_recipients.is_empty() {
            match EmailChannel::new(
                &config.smtp_host,
                config.smtp_port,
                username.clone(),
                password.clone(),
                config.email_recipients.clone(),
            ) {
                Ok(channel) => channels.push(Arc::new(channel)),
                Err(e) => tracing::warn!("email channel not installed: {e:#}"),
            }
        }
    }

    channels
}

/// Chat webhook channel posting severity-colored attachments.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

pub(crate) fn severity_color(severity: AlarmSeverity) -> &'static str {
    match severity {
        AlarmSeverity::Info => "good",
        AlarmSeverity::Warning => "warning",
        AlarmSeverity::Error => "danger",
        AlarmSeverity::Critical => "#ff0000",
    }
}

/// Build the webhook message body for an alarm.
pub(crate) fn webhook_message(event: &AlarmEvent, alarm_id: i32) -> Value {
    let mut fields = vec![
        json!({ "title": "Alarm ID", "value": alarm_id.to_string(), "short": true }),
        json!({ "title": "Severity", "value": event.severity.as_str().to_uppercase(), "short": true }),
        json!({ "title": "Type", "value": event.alarm_type.as_str(), "short": true }),
        json!({ "title": "Timestamp", "value": Utc::now().to_rfc3339(), "short": true }),
    ];

    if let Some(queue) = &event.queue_name {
        fields.push(json!({ "title": "Queue", "value": queue, "short": true }));
    }

    if let Some(component) = &event.component {
        fields.push(json!({ "title": "Component", "value": component, "short": true }));
    }

    if let Some(Value::Object(context)) = &event.context_data {
        let lines: Vec<String> = context
            .iter()
            .take(5)
            .map(|(key, value)| format!("- {key}: {value}"))
            .collect();
        fields.push(json!({ "title": "Context", "value": lines.join("\n"), "short": false }));
    }

    json!({
        "attachments": [{
            "color": severity_color(event.severity),
            "title": format!("Foreman Alarm: {}", event.title),
            "text": event.description,
            "fields": fields,
        }]
    })
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, event: &AlarmEvent, alarm_id: i32) -> anyhow::Result<()> {
        let message = webhook_message(event, alarm_id);

        self.client
            .post(&self.url)
            .json(&message)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(alarm_id, "webhook notification sent");
        Ok(())
    }
}

/// SMTP channel sending an HTML summary to the configured recipients.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: lettre::message::Mailbox,
    recipients: Vec<lettre::message::Mailbox>,
}

impl EmailChannel {
    pub fn new(
        smtp_host: &str,
        smtp_port: u16,
        username: String,
        password: String,
        recipients: Vec<String>,
    ) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)?
            .port(smtp_port)
            .credentials(Credentials::new(username.clone(), password))
            .build();

        let from = username.parse()?;
        let recipients = recipients
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transport,
            from,
            recipients,
        })
    }
}

pub(crate) fn email_body(event: &AlarmEvent, alarm_id: i32) -> String {
    let color = match event.severity {
        AlarmSeverity::Info => "#0066cc",
        AlarmSeverity::Warning => "#ff9900",
        AlarmSeverity::Error => "#cc0000",
        AlarmSeverity::Critical => "#990000",
    };

    let mut rows = format!(
        "<tr><td><strong>Alarm ID</strong></td><td>{alarm_id}</td></tr>\
         <tr><td><strong>Title</strong></td><td>{}</td></tr>\
         <tr><td><strong>Severity</strong></td><td style=\"color: {color};\">{}</td></tr>\
         <tr><td><strong>Type</strong></td><td>{}</td></tr>\
         <tr><td><strong>Timestamp</strong></td><td>{}</td></tr>",
        event.title,
        event.severity.as_str().to_uppercase(),
        event.alarm_type.as_str(),
        Utc::now().to_rfc3339(),
    );

    if let Some(queue) = &event.queue_name {
        rows.push_str(&format!(
            "<tr><td><strong>Queue</strong></td><td>{queue}</td></tr>"
        ));
    }

    if let Some(component) = &event.component {
        rows.push_str(&format!(
            "<tr><td><strong>Component</strong></td><td>{component}</td></tr>"
        ));
    }

    let mut context_section = String::new();
    if let Some(Value::Object(context)) = &event.context_data {
        context_section.push_str("<h3>Context Data</h3><ul>");
        for (key, value) in context {
            context_section.push_str(&format!("<li><strong>{key}</strong>: {value}</li>"));
        }
        context_section.push_str("</ul>");
    }

    format!(
        "<html><body>\
         <h2 style=\"color: {color};\">Foreman System Alarm</h2>\
         <table border=\"1\" style=\"border-collapse: collapse; width: 100%;\">{rows}</table>\
         <h3>Description</h3><p>{}</p>\
         {context_section}\
         <hr><p><em>This is an automated alert from foreman system monitoring.</em></p>\
         </body></html>",
        event.description,
    )
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, event: &AlarmEvent, alarm_id: i32) -> anyhow::Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("Foreman Alarm: {}", event.title))
            .header(ContentType::TEXT_HTML);

        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        let message = builder.body(email_body(event, alarm_id))?;
        self.transport.send(message).await?;

        tracing::debug!(alarm_id, recipients = self.recipients.len(), "email notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use foreman_core::alarm::AlarmType;

    use super::*;

    fn event() -> AlarmEvent {
        AlarmEvent::new(
            AlarmType::QueueBackup,
            AlarmSeverity::Warning,
            "Queue Backup Detected: default",
            "Queue 'default' has excessive pending tasks.",
        )
        .for_queue("default")
        .with_context(json!({ "pending_count": 150, "threshold": 100 }))
    }

    #[test]
    fn severity_colors_match_channel_conventions() {
        assert_eq!(severity_color(AlarmSeverity::Info), "good");
        assert_eq!(severity_color(AlarmSeverity::Warning), "warning");
        assert_eq!(severity_color(AlarmSeverity::Error), "danger");
        assert_eq!(severity_color(AlarmSeverity::Critical), "#ff0000");
    }

    #[test]
    fn webhook_message_carries_queue_and_context_fields() {
        let message = webhook_message(&event(), 7);
        let attachment = &message["attachments"][0];

        assert_eq!(attachment["color"], "warning");
        assert_eq!(attachment["title"], "Foreman Alarm: Queue Backup Detected: default");

        let fields = attachment["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["title"] == "Queue" && f["value"] == "default"));
        assert!(fields.iter().any(|f| f["title"] == "Alarm ID" && f["value"] == "7"));
        assert!(fields.iter().any(|f| f["title"] == "Context"));
    }

    #[test]
    fn email_body_includes_the_alarm_table() {
        let body = email_body(&event(), 7);

        assert!(body.contains("<td>7</td>"));
        assert!(body.contains("Queue Backup Detected: default"));
        assert!(body.contains("<td>WARNING</td>") || body.contains("WARNING</td>"));
        assert!(body.contains("pending_count"));
    }

    #[test]
    fn channels_from_empty_config_installs_nothing() {
        let config = foreman_core::Config::default().alerts;
        assert!(channels_from_config(&config).is_empty());
    }

    #[test]
    fn webhook_url_installs_the_webhook_channel() {
        let mut config = foreman_core::Config::default().alerts;
        config.webhook_url = Some("https://hooks.example.com/services/T/B/x".into());

        let channels = channels_from_config(&config);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name(), "webhook");
    }
}
