//! HTTP endpoints for garlic-turn.
//!
//! Provides health checks and Prometheus metrics.

pub mod health;
mod metrics;

use crate::server::TurnServer;
use axum::{routing::get, Extension, Router};

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: TurnServer) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryRoomRegistry;
    use crate::config::Config;
    use crate::overlay::MockOverlay;
    use crate::server::ServerParts;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn test_server() -> TurnServer {
        TurnServer::start(ServerParts {
            config: Config::default(),
            provider: Arc::new(MockOverlay::new()),
            rooms: Arc::new(MemoryRoomRegistry::new()),
            conventional: None,
        })
        .await
        .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = test_server().await;
        let app = build_router(server.clone());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["allocations"], 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let server = test_server().await;
        let app = build_router(server.clone());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("garlic_turn_allocations_active 0"));
        assert!(body.contains("# TYPE garlic_turn_requests_total counter"));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let server = test_server().await;
        let app = build_router(server.clone());

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        server.shutdown().await;
    }
}
