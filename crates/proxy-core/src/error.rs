use std::fmt;

/// Top-level error type returned by every proxy subsystem.
///
/// Mirrors the taxonomy clients see on the wire (`{error: {message, type,
/// code}}`): each variant below maps to exactly one `type` string and,
/// where applicable, one default HTTP status.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed JSON, missing `model`, `messages` present but not an array, etc.
    InvalidRequest(String),
    /// Missing/invalid client API key.
    AuthenticationError(String),
    /// Upstream returned 429/5xx or a network-class failure, and retries were exhausted.
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Upstream reported quota exhaustion. Remapped to HTTP 402 on egress.
    QuotaExceeded(String),
    /// Upstream returned 401/403; the owning credential has been marked inactive.
    UpstreamAuthError(String),
    /// Model does not support the requested endpoint and no fallback could be found.
    ModelNotSupported(String),
    /// Queue rejected the request because it was at capacity.
    QueueFull(String),
    /// No credential was available to service the request.
    NoAccountsAvailable,
    /// Client disconnected or an explicit cancellation fired. Not surfaced as an error body.
    Cancelled,
    /// An error surfaced by the upstream provider itself (already a 4xx/5xx from upstream).
    ProviderError(String),
    /// JSON (de)serialization failure.
    JsonError(String),
    /// Outbound HTTP transport failure.
    HttpError(String),
    /// State persistence failure (store/cache/history write or read).
    StorageError(String),
    /// Catch-all for invariant violations that should never happen in practice.
    Internal(String),
}

impl ProxyError {
    /// The `type` field of the `{error: {message, type, code?}}` response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::AuthenticationError(_) | ProxyError::UpstreamAuthError(_) => {
                "authentication_error"
            }
            ProxyError::RateLimited { .. } => "rate_limit_error",
            ProxyError::QuotaExceeded(_) => "invalid_request_error",
            ProxyError::ModelNotSupported(_) => "invalid_request_error",
            ProxyError::QueueFull(_) => "queue_full",
            ProxyError::NoAccountsAvailable => "overloaded_error",
            ProxyError::Cancelled => "error",
            ProxyError::ProviderError(_) => "error",
            ProxyError::JsonError(_) | ProxyError::HttpError(_) => "stream_error",
            ProxyError::StorageError(_) | ProxyError::Internal(_) => "error",
        }
    }

    /// Default HTTP status for this error when no upstream status is available to forward.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::ModelNotSupported(_) => 400,
            ProxyError::AuthenticationError(_) | ProxyError::UpstreamAuthError(_) => 401,
            ProxyError::QuotaExceeded(_) => 402,
            ProxyError::RateLimited { .. } => 429,
            ProxyError::QueueFull(_) | ProxyError::NoAccountsAvailable => 503,
            ProxyError::Cancelled => 499,
            ProxyError::ProviderError(_) => 502,
            ProxyError::JsonError(_)
            | ProxyError::HttpError(_)
            | ProxyError::StorageError(_)
            | ProxyError::Internal(_) => 500,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::InvalidRequest(e) => write!(f, "Invalid Request: {}", e),
            ProxyError::AuthenticationError(e) => write!(f, "Authentication Error: {}", e),
            ProxyError::RateLimited {
                message,
                retry_after_secs,
            } => match retry_after_secs {
                Some(s) => write!(f, "Rate Limited: {} (retry after {}s)", message, s),
                None => write!(f, "Rate Limited: {}", message),
            },
            ProxyError::QuotaExceeded(e) => write!(f, "Quota Exceeded: {}", e),
            ProxyError::UpstreamAuthError(e) => write!(f, "Upstream Auth Error: {}", e),
            ProxyError::ModelNotSupported(e) => write!(f, "Model Not Supported: {}", e),
            ProxyError::QueueFull(e) => write!(f, "Queue Full: {}", e),
            ProxyError::NoAccountsAvailable => write!(f, "No accounts available"),
            ProxyError::Cancelled => write!(f, "Request cancelled"),
            ProxyError::ProviderError(e) => write!(f, "Provider Error: {}", e),
            ProxyError::JsonError(e) => write!(f, "JSON Error: {}", e),
            ProxyError::HttpError(e) => write!(f, "HTTP Error: {}", e),
            ProxyError::StorageError(e) => write!(f, "Storage Error: {}", e),
            ProxyError::Internal(e) => write!(f, "Internal Error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::StorageError(err.to_string())
    }
}
