use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use proxy_core::ProxyError;
use serde_json::{json, Value};

/// Header names forwarded verbatim from an upstream error response to the
/// client (§7): everything else is dropped.
const FORWARDED_ERROR_HEADERS: &[&str] = &["retry-after", "www-authenticate", "x-request-id"];

/// Shapes a `ProxyError` into the `{error: {message, type, code?}}` body and
/// status code defined in §6/§7. The optional `HeaderMap` is the upstream
/// response's headers, present when the error originated from a dispatched
/// call, so the curated allow-list (§7) can be forwarded to the client.
pub struct ApiError(pub ProxyError, pub Option<HeaderMap>);

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        ApiError(e, None)
    }
}

impl ApiError {
    /// Attaches the upstream response headers an error was surfaced from, so
    /// `into_response` can forward the curated allow-list (§7).
    pub fn with_upstream_headers(error: ProxyError, upstream: HeaderMap) -> Self {
        ApiError(error, Some(upstream))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.error_type(),
            }
        });

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Bearer realm="proxy""#),
            );
        }
        if let ProxyError::RateLimited { retry_after_secs: Some(secs), .. } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        if let Some(upstream) = &self.1 {
            forward_curated_headers(response.headers_mut(), upstream);
        }

        response
    }
}

/// Copies the curated header allow-list from an upstream error response onto
/// the outgoing client response, plus any `x-ratelimit-*` header (§7).
pub fn forward_curated_headers(dst: &mut HeaderMap, upstream: &HeaderMap) {
    for name in FORWARDED_ERROR_HEADERS {
        if let Some(value) = upstream.get(*name) {
            if let Ok(name) = HeaderName::try_from(*name) {
                dst.insert(name, value.clone());
            }
        }
    }
    for (name, value) in upstream.iter() {
        if name.as_str().starts_with("x-ratelimit-") {
            dst.insert(name.clone(), value.clone());
        }
    }
}

/// Extracts `{message, code}` from an upstream error body, unwrapping one
/// layer of double-wrapping when the `message` field is itself a JSON string
/// containing another `{error: {message, code}}}` (§7).
pub fn normalize_upstream_error_body(body: &Value) -> (String, Option<String>) {
    let err = body.get("error").unwrap_or(body);
    let message = err.get("message").and_then(Value::as_str).unwrap_or("upstream error");
    let code = err.get("code").and_then(Value::as_str).map(String::from);

    if let Ok(inner) = serde_json::from_str::<Value>(message) {
        if let Some(inner_err) = inner.get("error") {
            let inner_message = inner_err.get("message").and_then(Value::as_str).unwrap_or(message);
            let inner_code = inner_err
                .get("code")
                .and_then(Value::as_str)
                .map(String::from)
                .or(code);
            return (inner_message.to_string(), inner_code);
        }
    }

    (message.to_string(), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwards_only_curated_headers_and_ratelimit_prefix() {
        let mut upstream = HeaderMap::new();
        upstream.insert("retry-after", HeaderValue::from_static("30"));
        upstream.insert("x-ratelimit-remaining", HeaderValue::from_static("5"));
        upstream.insert("x-internal-debug", HeaderValue::from_static("secret"));

        let mut dst = HeaderMap::new();
        forward_curated_headers(&mut dst, &upstream);

        assert!(dst.contains_key("retry-after"));
        assert!(dst.contains_key("x-ratelimit-remaining"));
        assert!(!dst.contains_key("x-internal-debug"));
    }

    #[test]
    fn unwraps_one_layer_of_double_wrapped_error_body() {
        let inner = json!({"error": {"message": "quota exceeded", "code": "insufficient_quota"}});
        let body = json!({"error": {"message": inner["error"].to_string(), "code": "wrapper"}});
        let (message, code) = normalize_upstream_error_body(&body);
        assert_eq!(message, "quota exceeded");
        assert_eq!(code.as_deref(), Some("insufficient_quota"));
    }

    #[test]
    fn passes_through_single_layer_error_unchanged() {
        let body = json!({"error": {"message": "bad request", "code": "invalid_request"}});
        let (message, code) = normalize_upstream_error_body(&body);
        assert_eq!(message, "bad request");
        assert_eq!(code.as_deref(), Some("invalid_request"));
    }
}
