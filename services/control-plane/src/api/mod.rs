//! HTTP API handlers and routing.

mod agent;
pub mod auth;
mod deployer;
pub mod error;
mod gatekeeper;
mod health;
pub mod request_context;

use axum::{routing::post, Router};
use fleet_protocol::{CI_WEBHOOK_PATH, GATEKEEPER_PATH};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .route(GATEKEEPER_PATH, post(gatekeeper::handle))
        .route(CI_WEBHOOK_PATH, post(deployer::ci_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fleet_protocol::TOKEN_HEADER;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::api::auth::AccessTokens;
    use crate::db::{MemoryStore, TENANTS};
    use crate::deployer::DeployerConfig;
    use crate::jobs::QueueConfig;
    use crate::provider::MockProvider;

    fn router() -> Router {
        let state = AppState::new(
            Arc::new(MemoryStore::new().with_unique_key(TENANTS, "slug")),
            Arc::new(MockProvider::new()),
            AccessTokens::new("agent-token", "operator-token"),
            QueueConfig::default(),
            DeployerConfig::default(),
        );
        create_router(state)
    }

    fn envelope(token: Option<&str>) -> Request<Body> {
        let body = json!({
            "service": "Fleet::Deployer",
            "action": "list_jobs",
            "payload": {"tenant_slug": "acme"},
        });
        let mut builder = Request::post(GATEKEEPER_PATH).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_gatekeeper_routes() {
        let response = router().oneshot(envelope(Some("operator-token"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router().oneshot(envelope(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router().oneshot(envelope(Some("agent-token"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_gatekeeper_is_post_only() {
        let request = Request::get(GATEKEEPER_PATH).body(Body::empty()).unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
