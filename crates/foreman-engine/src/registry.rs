//! The process-wide mapping from task types to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use foreman_core::{Error, Result};
use serde_json::Value;

type BoxedHandler =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

/// Maps a `task_type` string to the handler the worker runs for it.
///
/// Handlers take the opaque submission payload and return a JSON value.
/// Registration is idempotent: registering the same type twice overwrites
/// the previous handler and logs a warning. The registry is built at
/// startup and then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for a task type.
    pub fn register<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_type = task_type.into();

        let boxed: BoxedHandler = Box::new(move |payload| Box::pin(handler(payload)));
        if self.handlers.insert(task_type.clone(), boxed).is_some() {
            tracing::warn!(task_type, "handler re-registered, previous one replaced");
        }
    }

    /// Register a blocking handler. It runs on the blocking thread pool so
    /// it cannot starve the async scheduler.
    pub fn register_blocking<F>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + Clone + 'static,
    {
        self.register(task_type, move |payload| {
            let handler = handler.clone();
            async move {
                tokio::task::spawn_blocking(move || handler(payload))
                    .await
                    .map_err(|e| anyhow::anyhow!("blocking handler panicked: {e}"))?
            }
        });
    }

    /// Execute the handler registered for `task_type`.
    pub async fn execute(&self, task_type: &str, payload: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| Error::Handler(format!("no handler registered for task type '{task_type}'")))?;

        handler(payload)
            .await
            .map_err(|e| Error::Handler(format!("{e:#}")))
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn executes_registered_handler() {
        let mut registry = TaskRegistry::new();
        registry.register("echo", |payload| async move { Ok(payload) });

        let result = registry.execute("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_task_type_is_a_handler_error() {
        let registry = TaskRegistry::new();
        let error = registry.execute("missing", Value::Null).await.unwrap_err();
        assert!(matches!(error, Error::Handler(_)));
    }

    #[tokio::test]
    async fn re_registration_overwrites() {
        let mut registry = TaskRegistry::new();
        registry.register("t", |_| async { Ok(json!(1)) });
        registry.register("t", |_| async { Ok(json!(2)) });

        assert_eq!(registry.execute("t", Value::Null).await.unwrap(), json!(2));
        assert_eq!(registry.registered_types(), vec!["t"]);
    }

    #[tokio::test]
    async fn blocking_handlers_run_off_the_async_thread() {
        let mut registry = TaskRegistry::new();
        registry.register_blocking("sum", |payload| {
            let a = payload["a"].as_i64().unwrap_or(0);
            let b = payload["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let result = registry.execute("sum", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, json!(5));
    }
}
