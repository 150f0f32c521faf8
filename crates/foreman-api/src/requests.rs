//! Request payloads and their validation bounds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use foreman_core::model::{QueuePriority, TaskSubmission, TaskStatus};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSubmissionRequest {
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

impl TaskSubmissionRequest {
    pub fn validate(&self) -> Result<(), String> {
        check_length("task_type", &self.task_type, 1, 100)?;
        check_length("task_name", &self.task_name, 1, 200)?;
        check_length("queue_name", &self.queue_name, 1, 100)?;

        if let Some(correlation_id) = &self.correlation_id {
            check_length("correlation_id", correlation_id, 0, 100)?;
        }

        if let Some(timeout) = self.timeout_seconds {
            if !(1..=86_400).contains(&timeout) {
                return Err("timeout_seconds must be between 1 and 86400".to_owned());
            }
        }

        if let Some(retry_limit) = self.retry_limit {
            if !(0..=10).contains(&retry_limit) {
                return Err("retry_limit must be between 0 and 10".to_owned());
            }
        }

        if let Some(scheduled_at) = self.scheduled_at {
            if scheduled_at <= Utc::now() {
                return Err("scheduled_at must be in the future".to_owned());
            }
        }

        if let Some(tags) = &self.tags {
            for (key, value) in tags {
                if key.len() > 50 {
                    return Err(format!("tag key '{key}' exceeds 50 characters"));
                }
                if value.len() > 200 {
                    return Err(format!("tag value for '{key}' exceeds 200 characters"));
                }
            }
        }

        Ok(())
    }

    pub fn into_submission(self) -> TaskSubmission {
        TaskSubmission {
            task_type: self.task_type,
            task_name: self.task_name,
            payload: self.payload,
            priority: self.priority,
            queue_name: self.queue_name,
            correlation_id: self.correlation_id,
            scheduled_at: self.scheduled_at,
            timeout_seconds: self.timeout_seconds,
            tags: self.tags,
            retry_limit: self.retry_limit,
        }
    }
}

fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), String> {
    if value.len() < min || value.len() > max {
        Err(format!(
            "{field} must be between {min} and {max} characters"
        ))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueCreateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: QueuePriority,
    #[serde(default = "default_max_workers")]
    pub max_workers: i32,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
}

fn default_max_workers() -> i32 {
    4
}

fn default_retry_limit() -> i32 {
    3
}

fn default_timeout_seconds() -> i32 {
    300
}

impl QueueCreateRequest {
    pub fn validate(&self) -> Result<(), String> {
        check_length("name", &self.name, 1, 100)?;

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err("name may only contain letters, digits, underscores and dashes".to_owned());
        }

        if let Some(description) = &self.description {
            check_length("description", description, 0, 500)?;
        }

        if !(1..=50).contains(&self.max_workers) {
            return Err("max_workers must be between 1 and 50".to_owned());
        }
        if !(0..=10).contains(&self.retry_limit) {
            return Err("retry_limit must be between 0 and 10".to_owned());
        }
        if !(30..=3600).contains(&self.timeout_seconds) {
            return Err("timeout_seconds must be between 30 and 3600".to_owned());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueUpdateRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<QueuePriority>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub max_workers: Option<i32>,
    #[serde(default)]
    pub retry_limit: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
}

impl QueueUpdateRequest {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(description) = &self.description {
            check_length("description", description, 0, 500)?;
        }
        if let Some(max_workers) = self.max_workers {
            if !(1..=50).contains(&max_workers) {
                return Err("max_workers must be between 1 and 50".to_owned());
            }
        }
        if let Some(retry_limit) = self.retry_limit {
            if !(0..=10).contains(&retry_limit) {
                return Err("retry_limit must be between 0 and 10".to_owned());
            }
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            if !(30..=3600).contains(&timeout_seconds) {
                return Err("timeout_seconds must be between 30 and 3600".to_owned());
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlarmAcknowledgmentRequest {
    pub acknowledged_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyShutdownRequest {
    pub reason: String,
    pub initiated_by: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request() -> TaskSubmissionRequest {
        TaskSubmissionRequest {
            task_type: "noop".into(),
            task_name: "t1".into(),
            payload: json!({"x": 1}),
            priority: QueuePriority::Normal,
            queue_name: "default".into(),
            correlation_id: None,
            scheduled_at: None,
            timeout_seconds: None,
            tags: None,
            retry_limit: None,
        }
    }

    #[test]
    fn a_minimal_submission_validates() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        let mut r = request();
        r.timeout_seconds = Some(0);
        assert!(r.validate().is_err());

        r.timeout_seconds = Some(86_401);
        assert!(r.validate().is_err());

        r.timeout_seconds = Some(86_400);
        assert!(r.validate().is_ok());

        r.timeout_seconds = Some(1);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn retry_limit_bounds_are_enforced() {
        let mut r = request();
        r.retry_limit = Some(-1);
        assert!(r.validate().is_err());

        r.retry_limit = Some(11);
        assert!(r.validate().is_err());

        r.retry_limit = Some(10);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn scheduled_at_must_be_future() {
        let mut r = request();
        r.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(r.validate().is_err());

        r.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(r.validate().is_ok());
    }

    #[test]
    fn tag_lengths_are_bounded() {
        let mut r = request();

        let mut tags = HashMap::new();
        tags.insert("k".repeat(51), "v".into());
        r.tags = Some(tags);
        assert!(r.validate().is_err());

        let mut tags = HashMap::new();
        tags.insert("k".into(), "v".repeat(201));
        r.tags = Some(tags);
        assert!(r.validate().is_err());

        let mut tags = HashMap::new();
        tags.insert("k".repeat(50), "v".repeat(200));
        r.tags = Some(tags);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn empty_task_type_is_rejected() {
        let mut r = request();
        r.task_type = String::new();
        assert!(r.validate().is_err());

        r.task_type = "t".repeat(101);
        assert!(r.validate().is_err());
    }

    #[test]
    fn queue_names_are_token_shaped() {
        let valid = QueueCreateRequest {
            name: "bulk_imports-2".into(),
            description: None,
            priority: QueuePriority::Normal,
            max_workers: 4,
            retry_limit: 3,
            timeout_seconds: 300,
        };
        assert!(valid.validate().is_ok());

        let mut invalid = valid.clone();
        invalid.name = "bad name!".into();
        assert!(invalid.validate().is_err());

        let mut invalid = valid.clone();
        invalid.max_workers = 51;
        assert!(invalid.validate().is_err());

        let mut invalid = valid;
        invalid.timeout_seconds = 29;
        assert!(invalid.validate().is_err());
    }
}
