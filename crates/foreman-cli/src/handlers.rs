//! Built-in task handlers registered by every foreman process.
//!
//! Deployments register their own domain handlers on top of these; the
//! built-ins keep a fresh install testable end to end.

use std::time::Duration;

use foreman_engine::TaskRegistry;
use serde_json::json;

pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register("noop", |_payload| async move { Ok(json!({ "ok": true })) });

    registry.register("echo", |payload| async move { Ok(payload) });

    registry.register("sleep", |payload| async move {
        let seconds = payload
            .get("seconds")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            .clamp(0.0, 600.0);

        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(json!({ "slept_seconds": seconds }))
    });

    registry
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn noop_reports_ok() {
        let registry = builtin_registry();
        let result = registry.execute("noop", Value::Null).await.unwrap();
        assert_eq!(result, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn echo_returns_its_payload() {
        let registry = builtin_registry();
        let payload = json!({ "nested": { "x": 1 } });
        let result = registry.execute("echo", payload.clone()).await.unwrap();
        assert_eq!(result, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_honors_the_requested_duration() {
        let registry = builtin_registry();
        let result = registry
            .execute("sleep", json!({ "seconds": 2 }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "slept_seconds": 2.0 }));
    }
}
