//! The HTTP surface: thin façades over [`Engine`] operations.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use foreman_engine::Engine;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod dashboard;
mod error;
mod requests;
mod responses;
mod routes;

pub use self::dashboard::dashboard_router;
pub use self::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the API router for an assembled engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = cors_layer(&engine.config().api.allow_origins);
    let state = AppState { engine };

    Router::new()
        .route("/health", get(routes::health::system_health))
        .route("/health/quick", get(routes::health::quick))
        .route("/health/components", get(routes::health::components))
        .route("/tasks", post(routes::tasks::submit).get(routes::tasks::list))
        .route(
            "/tasks/:task_id",
            get(routes::tasks::status).delete(routes::tasks::cancel),
        )
        .route("/queues", get(routes::queues::list).post(routes::queues::create))
        .route("/queues/:name", put(routes::queues::update))
        .route("/queues/:name/health", get(routes::queues::health))
        .route("/alarms", get(routes::alarms::active))
        .route("/alarms/:alarm_id/acknowledge", post(routes::alarms::acknowledge))
        .route("/alarms/:alarm_id/resolve", post(routes::alarms::resolve))
        .route("/system/shutdown", post(routes::system::shutdown))
        .route("/system/status", get(routes::system::status))
        .route("/test/alarm", post(routes::system::test_alarm))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use foreman_core::{Config, DatabaseConfig};
    use foreman_engine::{Engine, TaskRegistry};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use super::*;

    // An engine over a pool that points at nothing. Handlers that hit the
    // store fail; the ones under test here (auth, debug gating, request
    // validation, quick health) never get that far, except the shutdown
    // path which is written to survive store failures.
    fn test_engine(mut config: Config) -> Arc<Engine> {
        config.database = DatabaseConfig {
            url: "postgresql://127.0.0.1:1/unreachable".to_owned(),
            pool_size: 1,
            max_overflow: 0,
            pool_timeout: std::time::Duration::from_millis(200),
            pool_recycle: std::time::Duration::from_secs(60),
        };

        let store = foreman_engine::store::Store::connect_lazy(&config.database).unwrap();
        Arc::new(Engine::assemble(config, store, Arc::new(TaskRegistry::new())))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn quick_health_answers_without_the_store() {
        let app = router(test_engine(Config::default()));

        let response = app
            .oneshot(Request::get("/health/quick").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "foreman-api");
    }

    #[tokio::test]
    async fn shutdown_without_token_is_unauthorized() {
        let app = router(test_engine(Config::default()));

        let request = Request::post("/system/shutdown")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "reason": "drill", "initiated_by": "ops" }).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn shutdown_with_wrong_token_is_forbidden() {
        let mut config = Config::default();
        config.api.shutdown_token = "right-token".into();
        let app = router(test_engine(config));

        let request = Request::post("/system/shutdown")
            .header("authorization", "Bearer wrong-token")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "reason": "drill", "initiated_by": "ops" }).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn shutdown_with_the_correct_token_initiates() {
        let mut config = Config::default();
        config.api.shutdown_token = "right-token".into();
        let engine = test_engine(config);
        let app = router(engine.clone());

        let request = Request::post("/system/shutdown")
            .header("authorization", "Bearer right-token")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "reason": "drill", "initiated_by": "ops" }).to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "shutdown_initiated");
        assert_eq!(body["initiated_by"], "ops");

        assert!(engine.shutdown_flag().is_raised());
        assert!(engine.shutdown().is_in_progress());
    }

    #[tokio::test]
    async fn test_alarm_is_forbidden_outside_debug() {
        let app = router(test_engine(Config::default()));

        let response = app
            .oneshot(Request::post("/test/alarm").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invalid_submission_bounds_are_rejected() {
        let app = router(test_engine(Config::default()));

        let request = Request::post("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "task_type": "noop",
                    "task_name": "t1",
                    "payload": {},
                    "timeout_seconds": 0
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
