use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// API-key gate (§6): accepts `x-api-key: <key>` or `authorization: Bearer
/// <key>`. When the configured key set is empty, auth is disabled entirely.
/// `OPTIONS` preflight requests bypass auth so CORS preflight never fails.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let accepted = &state.accepted_keys;
    if accepted.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match presented {
        Some(key) if accepted.contains(&key) => next.run(request).await,
        _ => unauthorized(),
    }
}

fn unauthorized() -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "missing or invalid API key").into_response();
    response.headers_mut().insert(
        axum::http::header::WWW_AUTHENTICATE,
        axum::http::HeaderValue::from_static(r#"Bearer realm="proxy""#),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app(keys: Vec<String>) -> Router {
        let state = Arc::new(AppState::test_with_keys(keys));
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key))
            .with_state(state)
    }

    #[tokio::test]
    async fn missing_key_is_rejected_when_keys_configured() {
        let app = app(vec!["secret".to_string()]);
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let app = app(vec!["secret".to_string()]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_api_key_header_is_accepted() {
        let app = app(vec!["secret".to_string()]);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_key_set_disables_auth() {
        let app = app(vec![]);
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
