use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use proxy_core::ProxyError;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::auth::require_api_key;
use crate::errors::ApiError;
use crate::models;
use crate::orchestrator::{self, Dialect};
use crate::state::AppState;

/// Builds the full route table (§6) over a shared `AppState`, with the
/// API-key middleware applied to every route and a permissive CORS layer so
/// browser-hosted agentic clients (e.g. a web IDE) can reach the proxy
/// directly.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/responses", post(responses))
        .route("/v1/responses", post(responses))
        .route("/embeddings", post(embeddings))
        .route("/v1/embeddings", post(embeddings))
        .route("/models", get(models::list_models))
        .route("/v1/models", get(models::list_models))
        .route("/health", get(health))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let payload = parse_json_body(&body)?;
    orchestrator::handle_completion(state, Dialect::OpenAi, payload).await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let payload = parse_json_body(&body)?;
    orchestrator::handle_completion(state, Dialect::Anthropic, payload).await
}

async fn responses(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let payload = parse_json_body(&body)?;
    orchestrator::handle_completion(state, Dialect::Responses, payload).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let payload = parse_json_body(&body)?;
    orchestrator::handle_embeddings(state, payload).await
}

fn parse_json_body(body: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::from(ProxyError::InvalidRequest(format!("invalid JSON body: {e}"))))
}

/// `GET /health` (§6): liveness only, no credential or upstream check.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_requires_key_like_any_other_route() {
        // §6 only carves out an OPTIONS-preflight bypass; /health is not special-cased.
        let state = Arc::new(AppState::test_with_keys(vec!["secret".to_string()]));
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn models_route_requires_key_when_configured() {
        let state = Arc::new(AppState::test_with_keys(vec!["secret".to_string()]));
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completions_rejects_malformed_json() {
        let state = Arc::new(AppState::test_with_keys(vec![]));
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
