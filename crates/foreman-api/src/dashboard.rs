//! A minimal operational dashboard: one static page polling the JSON
//! overview endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use foreman_engine::Engine;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::responses::AlarmResponse;
use crate::AppState;

/// Router for the dashboard process: the overview page plus the JSON it
/// polls, sharing the same engine as the API.
pub fn dashboard_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/dashboard/overview", get(overview))
        .with_state(AppState { engine })
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn overview(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.engine.system_status().await.map_err(|e| {
        tracing::error!("failed to read system status: {e}");
        ApiError::internal("Failed to build dashboard overview")
    })?;

    let queues = state.engine.manager().list_queues().await.map_err(|e| {
        tracing::error!("failed to list queues: {e}");
        ApiError::internal("Failed to build dashboard overview")
    })?;

    let alarms = state.engine.alarms().active_alarms().await.map_err(|e| {
        tracing::error!("failed to fetch alarms: {e}");
        ApiError::internal("Failed to build dashboard overview")
    })?;

    let mut queue_entries = Vec::with_capacity(queues.len());
    for queue in &queues {
        let health = state.engine.manager().queue_health(&queue.name).await.ok();
        queue_entries.push(json!({
            "name": queue.name,
            "is_active": queue.is_active,
            "priority": queue.priority,
            "health": health,
        }));
    }

    Ok(Json(json!({
        "system_status": status,
        "queues": queue_entries,
        "active_alarms": alarms.into_iter().map(AlarmResponse::from).collect::<Vec<_>>(),
        "last_report": state.engine.health().last_report(),
    })))
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>foreman dashboard</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #111; color: #eee; }
  h1 { font-size: 1.3rem; }
  pre { background: #1c1c1c; padding: 1rem; border-radius: 6px; overflow-x: auto; }
  .critical { color: #ff5555; }
  .degraded { color: #ffaa00; }
  .healthy { color: #55cc77; }
</style>
</head>
<body>
<h1>foreman <span id="overall">…</span></h1>
<pre id="overview">loading…</pre>
<script>
async function refresh() {
  try {
    const response = await fetch('/dashboard/overview');
    const data = await response.json();
    const overall = data.system_status ? data.system_status.overall_health : 'unknown';
    const badge = document.getElementById('overall');
    badge.textContent = overall;
    badge.className = overall;
    document.getElementById('overview').textContent = JSON.stringify(data, null, 2);
  } catch (e) {
    document.getElementById('overview').textContent = 'overview unavailable: ' + e;
  }
}
refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>
"#;
