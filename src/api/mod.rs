//! HTTP API module
//!
//! This module assembles the handler graph the request server runs:
//! routes, the static upload server, and the request middleware stack.

pub mod handlers;
pub mod responses;

use axum::{routing::get, Router};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::{
    config::{Limits, StorageSettings},
    state::AppState,
};
use handlers::*;

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState, storage: &StorageSettings, limits: &Limits) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .nest_service(&storage.public_prefix, ServeDir::new(&storage.upload_dir))
        .layer(CatchPanicLayer::new())
        .layer(RequestBodyLimitLayer::new(limits.max_body_bytes()))
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DatabaseConfig,
        services::PasteDb,
        state::Phase,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tokio::sync::watch;
    use tower::ServiceExt;

    async fn router(dir: &std::path::Path) -> (Router, watch::Sender<Phase>) {
        let db = PasteDb::open(&DatabaseConfig {
            path: dir.join("paste.json"),
            collection: "pastes".to_string(),
        })
        .await
        .unwrap();
        let (phase_tx, phase_rx) = watch::channel(Phase::Running);
        let (_reports_tx, reports_rx) = watch::channel(None);
        let state = AppState::new(Arc::new(db), phase_rx, reports_rx);

        let storage = StorageSettings {
            upload_dir: dir.join("uploads"),
            public_prefix: "/uploads".to_string(),
        };
        std::fs::create_dir_all(&storage.upload_dir).unwrap();
        std::fs::write(storage.upload_dir.join("cat.png"), b"meow").unwrap();

        (create_router(state, &storage, &Limits::default()), phase_tx)
    }

    #[tokio::test]
    async fn health_sets_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _phase) = router(dir.path()).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn keeps_caller_request_id() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _phase) = router(dir.path()).await;

        let response = app
            .oneshot(
                Request::get("/health")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn serves_uploaded_files() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _phase) = router(dir.path()).await;

        let response = app
            .clone()
            .oneshot(Request::get("/uploads/cat.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"meow");

        let missing = app
            .oneshot(Request::get("/uploads/dog.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (app, phase) = router(dir.path()).await;
        phase.send_replace(Phase::ShuttingDown);

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["phase"], "shutting-down");
        assert_eq!(json["records"], 0);
        assert!(json["last_reap"].is_null());
    }
}
