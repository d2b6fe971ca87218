//! Router configuration for the execbox server.

use axum::{middleware, routing::get, Router};
use execbox_utils::EXECUTE_WS_PATH;

use crate::{handler, middleware as app_middleware, state::AppState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Create a new router with the given state
pub fn create_router(state: AppState) -> Router {
    let rest_api = Router::new()
        .route("/health", get(handler::health))
        .route("/status", get(handler::status));

    Router::new()
        .route("/", get(handler::root))
        .route(EXECUTE_WS_PATH, get(handler::execute_ws))
        .nest("/api/v1", rest_api)
        .layer(middleware::from_fn(app_middleware::logging_middleware))
        .with_state(state)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use execbox_core::engine::MemoryEngine;
    use tower::ServiceExt;

    use super::*;
    use crate::ServerConfig;

    fn router(engine: &MemoryEngine) -> (Router, AppState) {
        let config = Arc::new(ServerConfig::new("127.0.0.1", 0, true).unwrap());
        let state = AppState::new(config, Arc::new(engine.clone())).unwrap();
        (create_router(state.clone()), state)
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let engine = MemoryEngine::new();
        let (router, _) = router(&engine);

        let (status, body) = get_body(router.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "API is running...");

        let (status, body) = get_body(router, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"message":"Service is healthy"}"#);
    }

    #[tokio::test]
    async fn test_status_lists_pooled_sandboxes() {
        let engine = MemoryEngine::new();
        let (router, state) = router(&engine);
        state.get_pool().acquire("python").await.unwrap();

        let (status, body) = get_body(router, "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["sandboxes"][0]["runtime"], "python");
        assert_eq!(value["sandboxes"][0]["image"], "python:3.10-slim");
        assert_eq!(value["sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_plain_get_on_websocket_path_is_rejected() {
        let engine = MemoryEngine::new();
        let (router, _) = router(&engine);

        let (status, _) = get_body(router, EXECUTE_WS_PATH).await;
        assert!(status.is_client_error());
    }
}
