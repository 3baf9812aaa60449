#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

use api_state::ApiState;
use axum::{
    routing::{get, post},
    Router,
};
use routes::{
    episodes::{delete_episode, episode_status, retry_episode},
    ingest::ingest_data,
    liveness::live,
    readiness::ready,
    search::search_data,
};

pub mod api_state;
pub mod error;
mod routes;

/// Router for API functionality, version 1.
///
/// Probes are public; every other endpoint requires the upstream-injected
/// identity headers and is scoped to that caller.
pub fn api_routes_v1(app_state: ApiState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live))
        .route("/ingest", post(ingest_data))
        .route("/search", post(search_data))
        .route("/episodes/{id}", get(episode_status).delete(delete_episode))
        .route("/episodes/{id}/retry", post(retry_episode))
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::{
        error::AppError,
        storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes},
        utils::config::AppConfig,
    };
    use ingestion_pipeline::IngestionConfig;
    use retrieval_pipeline::{QueryServices, RetrievalConfig, SearchMode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;

    struct StubQueryServices;

    #[async_trait]
    impl QueryServices for StubQueryServices {
        async fn classify_query(&self, _query: &str) -> Result<Vec<SearchMode>, AppError> {
            Ok(vec![SearchMode::Lexical])
        }

        async fn embed_query(&self, _query: &str) -> Result<Vec<f32>, AppError> {
            Ok(vec![1.0, 0.0, 0.0])
        }

        async fn extract_query_entities(&self, _query: &str) -> Result<Vec<String>, AppError> {
            Ok(Vec::new())
        }
    }

    async fn test_router(queue_max_depth: usize) -> Router {
        let db = Arc::new(
            SurrealDbClient::memory("api_test", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        ensure_runtime_indexes(&db, 3)
            .await
            .expect("failed to build runtime indexes");

        let state = ApiState::new(
            db,
            AppConfig::for_tests(),
            IngestionConfig::default().with_queue_depth(queue_max_depth),
            RetrievalConfig::default(),
            Arc::new(StubQueryServices),
            None,
        );
        api_routes_v1(state)
    }

    fn ingest_request(body: Value, with_identity: bool) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/ingest")
            .header("content-type", "application/json");
        if with_identity {
            builder = builder.header("x-user-id", "user-1");
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn ingest_accepts_and_returns_the_job_id() {
        let router = test_router(100).await;

        let response = router
            .oneshot(ingest_request(
                json!({
                    "episodeBody": "Alice works at Acme.",
                    "sessionId": "s1"
                }),
                true,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert!(body["id"].is_string());
    }

    #[tokio::test]
    async fn ingest_without_identity_is_unauthorized() {
        let router = test_router(100).await;

        let response = router
            .oneshot(ingest_request(
                json!({ "episodeBody": "text", "sessionId": "s1" }),
                false,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ingest_with_empty_body_is_a_validation_error() {
        let router = test_router(100).await;

        let response = router
            .oneshot(ingest_request(
                json!({ "episodeBody": "  ", "sessionId": "s1" }),
                true,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_queue_maps_to_429() {
        let router = test_router(0).await;

        let response = router
            .oneshot(ingest_request(
                json!({ "episodeBody": "text", "sessionId": "s1" }),
                true,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn job_status_is_visible_after_ingest() {
        let router = test_router(100).await;

        let response = router
            .clone()
            .oneshot(ingest_request(
                json!({ "episodeBody": "Alice works at Acme.", "sessionId": "s1" }),
                true,
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let id = body["id"].as_str().expect("id").to_owned();

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/episodes/{id}"))
                    .header("x-user-id", "user-1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "PENDING");
    }

    #[tokio::test]
    async fn status_is_scoped_to_the_caller() {
        let router = test_router(100).await;

        let response = router
            .clone()
            .oneshot(ingest_request(
                json!({ "episodeBody": "secret", "sessionId": "s1" }),
                true,
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let id = body["id"].as_str().expect("id").to_owned();

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/episodes/{id}"))
                    .header("x-user-id", "someone-else")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_returns_empty_results_on_a_fresh_store() {
        let router = test_router(100).await;

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/search")
                    .header("content-type", "application/json")
                    .header("x-user-id", "user-1")
                    .body(Body::from(
                        json!({ "query": "anything", "mode": "lexical" }).to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["results"], json!([]));
    }
}
