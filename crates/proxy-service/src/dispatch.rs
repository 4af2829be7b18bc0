use std::fs;
use std::time::Duration;

use once_cell::sync::Lazy;
use proxy_core::{
    now_unix, Content, CredentialRecord, Message, Part, ProxyError, QuotaBucket, QuotaSnapshot, Role,
};
use proxy_runtime::{is_retryable_network_error, is_retryable_status, parse_retry_after, RetryPolicy};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A single, global client shared by every outbound call, built once.
pub static CLIENT: Lazy<Client> = Lazy::new(Client::new);

static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

const INTEGRATION_ID: &str = "code-proxy";
const EDITOR_VERSION: &str = concat!("code-proxy/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2025-04-01";

/// The upstream endpoint an outbound call targets, each with its own
/// timeout default (§5): token exchange 10s, usage 30s, embeddings 30s,
/// models-list 10s, chat completion 60s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    TokenExchange,
    Usage,
    Embeddings,
    ModelsList,
    ChatCompletion,
}

impl Endpoint {
    pub fn timeout(self) -> Duration {
        match self {
            Endpoint::TokenExchange => Duration::from_secs(10),
            Endpoint::Usage => Duration::from_secs(30),
            Endpoint::Embeddings => Duration::from_secs(30),
            Endpoint::ModelsList => Duration::from_secs(10),
            Endpoint::ChatCompletion => Duration::from_secs(60),
        }
    }
}

/// Reads every interface under `/sys/class/net`, sorted by interface name
/// for determinism, and returns the first MAC address that isn't the
/// all-zero loopback address.
fn first_non_trivial_mac() -> Option<String> {
    let mut interfaces: Vec<(String, String)> = fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let mac = fs::read_to_string(entry.path().join("address")).ok()?.trim().to_lowercase();
            Some((name, mac))
        })
        .collect();
    interfaces.sort_by(|a, b| a.0.cmp(&b.0));
    interfaces.into_iter().map(|(_, mac)| mac).find(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
}

/// Process-wide machine identifier (§6): a SHA-256 digest of the first
/// non-trivial MAC address this host exposes, read from `/sys/class/net`.
/// Falls back to the hostname, and finally to a fixed string, so the header
/// is always present even on a host with no real NIC (e.g. a container
/// network namespace).
fn machine_id() -> String {
    let seed = first_non_trivial_mac()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown-host".to_string());

    let digest = Sha256::digest(seed.as_bytes());
    format!("{:x}", digest)
}

/// `agent` iff the most recent message is from the assistant or a tool,
/// else `user` (§6) — distinguishes an agent continuing its own turn from a
/// human kicking one off.
fn initiator_for(messages: &[Message]) -> &'static str {
    match messages.last().map(|m| &m.role) {
        Some(Role::Assistant) | Some(Role::Tool) => "agent",
        _ => "user",
    }
}

fn message_has_image(message: &Message) -> bool {
    match &message.content {
        Content::Parts(parts) => parts.iter().any(|p| matches!(p, Part::ImageUrl { .. })),
        Content::Text(_) | Content::Null => false,
    }
}

/// Whether any message in the conversation carries an image part, gating
/// the vision-enable header (§6).
pub fn requires_vision(messages: &[Message]) -> bool {
    messages.iter().any(message_has_image)
}

fn build_headers(token: &str, messages: &[Message], vision: bool) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    let insert = |headers: &mut reqwest::header::HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = reqwest::header::HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    };

    insert(&mut headers, "authorization", format!("Bearer {token}"));
    insert(&mut headers, "content-type", "application/json".to_string());
    insert(&mut headers, "x-integration-id", INTEGRATION_ID.to_string());
    insert(&mut headers, "x-editor-version", EDITOR_VERSION.to_string());
    insert(&mut headers, "user-agent", EDITOR_VERSION.to_string());
    insert(&mut headers, "x-api-version", API_VERSION.to_string());
    insert(&mut headers, "x-request-id", Uuid::new_v4().to_string());
    insert(&mut headers, "x-machine-id", machine_id());
    insert(&mut headers, "x-session-id", SESSION_ID.clone());
    insert(&mut headers, "x-initiator", initiator_for(messages).to_string());
    if vision {
        insert(&mut headers, "x-vision-enabled", "true".to_string());
    }
    headers
}

/// Outcome of a single outbound call: either an upstream JSON body with its
/// HTTP status and response headers, or a transport-level failure before any
/// status was read. The headers are carried so an error surfaced to the
/// client can forward the curated allow-list (§7) instead of dropping them.
pub enum DispatchOutcome {
    Response {
        status: u16,
        body: Value,
        headers: reqwest::header::HeaderMap,
        retry_after: Option<Duration>,
    },
    TransportError(String),
}

async fn send_once(
    url: &str,
    token: &str,
    messages: &[Message],
    payload: &Value,
    endpoint: Endpoint,
) -> DispatchOutcome {
    let vision = requires_vision(messages);
    let headers = build_headers(token, messages, vision);
    let request = CLIENT.post(url).headers(headers).json(payload);

    match tokio::time::timeout(endpoint.timeout(), request.send()).await {
        Ok(Ok(response)) => parse_response(response).await,
        Ok(Err(e)) => DispatchOutcome::TransportError(e.to_string()),
        Err(_) => DispatchOutcome::TransportError("request timed out".to_string()),
    }
}

async fn parse_response(response: Response) -> DispatchOutcome {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let retry_after = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    let body = match response.json::<Value>().await {
        Ok(body) => body,
        Err(e) => return DispatchOutcome::TransportError(e.to_string()),
    };

    DispatchOutcome::Response { status, body, headers, retry_after }
}

/// Dispatches one upstream call, transparently retrying transient failures
/// up to `RetryPolicy`'s attempt budget (§4.11). Returns the first
/// non-transient response (success or a permanent error) verbatim, or a
/// `ProxyError::RateLimited`/`ProxyError::ProviderError` once retries are
/// exhausted.
pub async fn dispatch_with_retry(
    url: &str,
    token: &str,
    messages: &[Message],
    payload: &Value,
    endpoint: Endpoint,
) -> Result<(u16, Value, reqwest::header::HeaderMap), ProxyError> {
    let mut policy = RetryPolicy::new();

    loop {
        match send_once(url, token, messages, payload, endpoint).await {
            DispatchOutcome::Response { status, body, headers, retry_after } => {
                if !is_retryable_status(status) {
                    return Ok((status, body, headers));
                }
                match policy.next_delay(retry_after) {
                    Some(delay) => {
                        tracing::debug!(status, attempt = policy.attempts_made(), "retrying upstream call");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        return Err(ProxyError::RateLimited {
                            message: format!("upstream returned {status} after exhausting retries"),
                            retry_after_secs: retry_after.map(|d| d.as_secs()),
                        });
                    }
                }
            }
            DispatchOutcome::TransportError(message) => {
                if !is_retryable_network_error(&message) {
                    return Err(ProxyError::HttpError(message));
                }
                match policy.next_delay(None) {
                    Some(delay) => {
                        tracing::debug!(attempt = policy.attempts_made(), error = %message, "retrying after transport error");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => return Err(ProxyError::HttpError(message)),
                }
            }
        }
    }
}

/// Opens a streaming upstream call and returns the raw response for the
/// caller to read incrementally. Unlike `dispatch_with_retry`, a streaming
/// call is attempted once: retrying a partially-consumed SSE body would
/// require replaying frames the client may already have seen, so a
/// mid-stream failure instead goes through the error-terminator path (§4.9)
/// rather than the transient-retry loop (§4.11).
pub async fn dispatch_stream(
    url: &str,
    token: &str,
    messages: &[Message],
    payload: &Value,
    endpoint: Endpoint,
) -> Result<Response, ProxyError> {
    let vision = requires_vision(messages);
    let headers = build_headers(token, messages, vision);
    let request = CLIENT.post(url).headers(headers).json(payload);

    let response = tokio::time::timeout(endpoint.timeout(), request.send())
        .await
        .map_err(|_| ProxyError::HttpError("request timed out".to_string()))?
        .map_err(ProxyError::from)?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let (message, _code) = crate::errors::normalize_upstream_error_body(&body);
        return Err(ProxyError::ProviderError(format!("upstream returned {status}: {message}")));
    }

    Ok(response)
}

/// Exchanges a credential's long-lived secret for a short-lived session
/// token (§4.4), the `exchange` closure `ensure_fresh_token`/
/// `AccountPool::select_with_token` call when a credential's token is
/// missing or within its refresh safety margin. Timeout-bounded at the
/// token-exchange default (10s); no retry loop here — a failed exchange
/// deactivates the credential and the pool moves on to the next one.
pub async fn exchange_session_token(
    cred: &CredentialRecord,
    base_url: &str,
) -> Result<(String, i64), ProxyError> {
    let url = format!("{base_url}/login");
    let body = json!({"credential": cred.credential});
    let request = CLIENT.post(&url).json(&body);

    let response = tokio::time::timeout(Endpoint::TokenExchange.timeout(), request.send())
        .await
        .map_err(|_| ProxyError::UpstreamAuthError("token exchange timed out".to_string()))?
        .map_err(|e| ProxyError::UpstreamAuthError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ProxyError::UpstreamAuthError(format!(
            "token exchange failed with status {}",
            response.status()
        )));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamAuthError(e.to_string()))?;
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::UpstreamAuthError("token exchange response missing token".into()))?
        .to_string();
    let expires_in = body.get("expires_in").and_then(Value::as_i64).unwrap_or(3600);

    Ok((token, now_unix() + expires_in))
}

/// C2's `fetch(cred)`: RPC to the upstream usage endpoint, parsed into a
/// `QuotaSnapshot`. Timeout-bounded at the usage default (30s); a failure
/// here just leaves the credential's existing snapshot in place (or `None`,
/// meaning "presumed sufficient" per `CredentialRecord::effective_percent`)
/// rather than propagating — a transient usage-endpoint outage should not
/// pause every credential in the pool.
pub async fn fetch_quota_snapshot(cred: &CredentialRecord, base_url: &str) -> Result<QuotaSnapshot, ProxyError> {
    let token = cred
        .session_token
        .clone()
        .ok_or_else(|| ProxyError::UpstreamAuthError("no session token for quota fetch".into()))?;
    let url = format!("{base_url}/usage");
    let request = CLIENT.get(&url).bearer_auth(token);

    let response = tokio::time::timeout(Endpoint::Usage.timeout(), request.send())
        .await
        .map_err(|_| ProxyError::HttpError("usage fetch timed out".to_string()))?
        .map_err(ProxyError::from)?;

    if !response.status().is_success() {
        return Err(ProxyError::HttpError(format!("usage endpoint returned {}", response.status())));
    }

    let body: Value = response.json().await.map_err(ProxyError::from)?;
    Ok(parse_quota_snapshot(&body))
}

fn parse_bucket(value: &Value) -> QuotaBucket {
    let remaining = value.get("remaining").and_then(Value::as_i64).unwrap_or(0);
    let entitlement = value.get("entitlement").and_then(Value::as_i64).unwrap_or(0);
    let unlimited = value.get("unlimited").and_then(Value::as_bool).unwrap_or(false);
    let percent_remaining = value
        .get("percent_remaining")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| if entitlement > 0 { (remaining as f64 / entitlement as f64) * 100.0 } else { 100.0 });
    QuotaBucket { remaining, entitlement, percent_remaining, unlimited }
}

fn parse_quota_snapshot(body: &Value) -> QuotaSnapshot {
    QuotaSnapshot {
        chat: body.get("chat").map(parse_bucket).unwrap_or_default(),
        completions: body.get("completions").map(parse_bucket).unwrap_or_default(),
        premium_interactions: body.get("premium_interactions").map(parse_bucket).unwrap_or_default(),
        reset_date: body.get("reset_date").and_then(Value::as_str).unwrap_or_default().to_string(),
        fetched_at: now_unix(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::Message;

    #[test]
    fn initiator_is_agent_after_assistant_or_tool_turn() {
        assert_eq!(initiator_for(&[Message::user("hi")]), "user");
        let mut assistant = Message::user("hi");
        assistant.role = Role::Assistant;
        assert_eq!(initiator_for(&[assistant]), "agent");
        let mut tool = Message::user("hi");
        tool.role = Role::Tool;
        assert_eq!(initiator_for(&[tool]), "agent");
    }

    #[test]
    fn vision_is_detected_from_image_parts() {
        let text_only = vec![Message::user("describe this")];
        assert!(!requires_vision(&text_only));

        let mut with_image = Message::user("describe this");
        with_image.content = Content::Parts(vec![Part::ImageUrl {
            image_url: proxy_core::ImageUrl { url: "https://example.com/a.png".to_string(), detail: None },
        }]);
        assert!(requires_vision(&[with_image]));
    }

    #[test]
    fn machine_id_is_stable_across_calls() {
        assert_eq!(machine_id(), machine_id());
        assert_eq!(machine_id().len(), 64);
    }

    #[test]
    fn endpoint_timeouts_match_spec_table() {
        assert_eq!(Endpoint::TokenExchange.timeout(), Duration::from_secs(10));
        assert_eq!(Endpoint::Usage.timeout(), Duration::from_secs(30));
        assert_eq!(Endpoint::Embeddings.timeout(), Duration::from_secs(30));
        assert_eq!(Endpoint::ModelsList.timeout(), Duration::from_secs(10));
        assert_eq!(Endpoint::ChatCompletion.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn quota_snapshot_parses_explicit_percent_remaining() {
        let body = json!({
            "chat": {"remaining": 30, "entitlement": 100, "percent_remaining": 30.0, "unlimited": false},
            "completions": {"remaining": 0, "entitlement": 0, "percent_remaining": 0.0, "unlimited": true},
            "premium_interactions": {"remaining": 5, "entitlement": 100, "percent_remaining": 5.0, "unlimited": false},
            "reset_date": "2026-08-01",
        });
        let snapshot = parse_quota_snapshot(&body);
        assert_eq!(snapshot.chat.percent_remaining, 30.0);
        assert!(snapshot.completions.unlimited);
        assert_eq!(snapshot.effective_percent(), 5.0);
    }

    #[test]
    fn quota_bucket_derives_percent_from_remaining_when_absent() {
        let bucket = parse_bucket(&json!({"remaining": 25, "entitlement": 50}));
        assert_eq!(bucket.percent_remaining, 50.0);
    }
}
