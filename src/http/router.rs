use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;
use crate::retrieval::RetrievalEngine;
use crate::store::RelationalStore;

use super::handlers;

pub struct AppState {
    pub store: Arc<dyn RelationalStore>,
    pub retrieval: Arc<RetrievalEngine>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route("/sessions", get(handlers::list_sessions).post(handlers::create_session))
        .route("/sessions/{id}/messages", get(handlers::session_messages))
        .route("/profile", get(handlers::get_profile))
        .route("/analysis/status", get(handlers::analysis_status))
        .route("/user", get(handlers::get_user))
        .route("/user/name", put(handlers::update_user_name))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::condensation::CondensationEngine;
    use crate::config::Config;
    use crate::llm::{GenerateOutput, GenerateParams, LlmClient, LlmProvider};
    use crate::locks::LockRegistry;
    use crate::orchestrator::Orchestrator;
    use crate::retrieval::RetrievalEngine;
    use crate::store::SqliteStore;
    use crate::vector_store::SqliteVectorStore;
    use crate::error::AppResult;

    struct UnusedProvider;

    #[async_trait]
    impl LlmProvider for UnusedProvider {
        async fn generate_once(&self, _params: &GenerateParams) -> AppResult<GenerateOutput> {
            panic!("no test in this module should reach the LLM");
        }
    }

    async fn test_state() -> Arc<AppState> {
        let store: Arc<dyn crate::store::RelationalStore> =
            Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let vectors: Arc<dyn crate::vector_store::VectorStore> =
            Arc::new(SqliteVectorStore::connect("sqlite::memory:").await.unwrap());
        let llm = Arc::new(LlmClient::for_test(UnusedProvider, UnusedProvider));
        let config = Config::default();

        let condensation = Arc::new(CondensationEngine::new(
            store.clone(),
            llm.clone(),
            config.models.clone(),
            config.aegean_consensus.clone(),
            config.condensation.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            vectors.clone(),
            llm.clone(),
            condensation.clone(),
            &config,
        ));
        let locks = Arc::new(LockRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            llm.clone(),
            retrieval.clone(),
            locks,
            &config,
            "persona",
        ));

        Arc::new(AppState { store, retrieval, orchestrator })
    }

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
    }

    #[tokio::test]
    async fn chat_without_bearer_token_is_rejected() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"text": "hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
