use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use signaling_cell::router::signaling_routes;
use signaling_cell::SignalingState;

pub fn create_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic signaling API is running!" }))
        .nest("/signaling", signaling_routes(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use tower::ServiceExt;

    use shared_utils::test_utils::TestConfig;

    fn test_app() -> Router {
        let state = Arc::new(SignalingState::in_memory(TestConfig::default().to_arc()));
        create_router(state)
    }

    #[tokio::test]
    async fn test_root_and_nested_health() {
        let response = test_app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = test_app()
            .oneshot(Request::builder().uri("/signaling/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let response = test_app()
            .oneshot(Request::builder().uri("/signaling/notifications").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
