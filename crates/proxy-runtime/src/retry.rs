use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_millis(8000);
const JITTER_FACTOR: f64 = 0.1;

/// Transient retry policy (§4.11): up to `MAX_ATTEMPTS` total attempts,
/// exponential backoff doubling from `BASE_DELAY`, capped at `MAX_DELAY`,
/// with ±10% jitter supplied by `backoff`'s own `randomization_factor`
/// rather than a hand-rolled jitter (no `rand` dependency exists anywhere
/// else in this workspace).
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        let mut backoff = ExponentialBackoff {
            initial_interval: BASE_DELAY,
            multiplier: 2.0,
            max_interval: MAX_DELAY,
            randomization_factor: JITTER_FACTOR,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff.reset();
        RetryPolicy { backoff, attempts: 0 }
    }

    pub fn max_attempts(&self) -> u32 {
        MAX_ATTEMPTS
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_ATTEMPTS
    }

    /// Advances the attempt counter and returns the delay to wait before the
    /// next attempt. `retry_after` overrides the computed backoff when the
    /// failure was a 429 carrying a `Retry-After` header, still capped at
    /// `MAX_DELAY` (no jitter applied to an explicit server-declared wait).
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= MAX_ATTEMPTS {
            return None;
        }
        if let Some(retry_after) = retry_after {
            return Some(retry_after.min(MAX_DELAY));
        }
        self.backoff.next_backoff().map(|d| d.min(MAX_DELAY))
    }
}

/// Whether an upstream HTTP status is worth retrying (§4.11).
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Whether a transport-level failure message describes a network-class
/// condition worth retrying. Client-initiated cancellation (`AbortError`) is
/// explicitly excluded — retrying a request the caller already gave up on
/// would waste a credential's quota for nothing.
pub fn is_retryable_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("aborterror") || lower.contains("operation was aborted") {
        return false;
    }
    ["reset", "refused", "timeout", "timed out", "dns", "fetch failed", "connection closed"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Parses a `Retry-After` header value: either a plain integer seconds count
/// or an HTTP-date (RFC 2822). Returns `None` for anything else.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let target = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let now = chrono::Utc::now();
    let delta = target.with_timezone(&chrono::Utc) - now;
    delta.to_std().ok()
}

/// Errors that indicate quota exhaustion are remapped from 429 to 402 on the
/// way back to the client (§4.11): 429 would make agentic clients retry into
/// a loop, 402 signals non-retryable.
pub fn remap_quota_exhaustion(status: u16, code: Option<&str>, message: &str) -> u16 {
    if status != 429 {
        return status;
    }
    let lower = message.to_lowercase();
    let code_matches = matches!(code, Some("quota_exceeded") | Some("insufficient_quota"));
    let message_matches = lower.contains("no quota") || lower.contains("quota exceeded");
    if code_matches || message_matches {
        402
    } else {
        status
    }
}

/// Minimal model-registry view the fallback selector needs: an id, the
/// declared endpoint support, and whether it is a "responses"-only model.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub id: String,
    pub supports_endpoint: bool,
    pub is_preview: bool,
}

/// Strips known non-semantic suffixes from a model id so siblings in the
/// same family can be compared: a `-codex-<suffix>` variant marker, and
/// dated suffixes of the form `-YYYY-MM-DD`.
pub fn normalize_model_id(id: &str) -> String {
    let mut out = id.to_string();
    if let Some(idx) = out.find("-codex-") {
        out.truncate(idx + "-codex".len());
    }
    if let Some(idx) = dated_suffix_start(&out) {
        out.truncate(idx);
    }
    out
}

fn dated_suffix_start(id: &str) -> Option<usize> {
    if id.len() < 11 {
        return None;
    }
    let tail = &id[id.len() - 10..];
    let is_date = tail.as_bytes().iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    if is_date {
        Some(id.len() - 11)
    } else {
        None
    }
}

fn vendor_of(id: &str) -> &str {
    id.split(['-', '/']).next().unwrap_or(id)
}

fn family_of(id: &str) -> String {
    normalize_model_id(id)
        .split(['-', '/'])
        .take(2)
        .collect::<Vec<_>>()
        .join("-")
}

fn is_codex_variant(id: &str) -> bool {
    id.contains("codex")
}

fn shared_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Scores how good a fallback candidate is for a requested model that no
/// longer fits the endpoint being called (§4.11): `+50` same vendor, `+80`
/// same family, `+15` matching codex/non-codex-ness, up to `+40` for shared
/// prefix length, `+5` for a non-preview model.
pub fn score_sibling(requested_id: &str, candidate: &ModelDescriptor) -> i64 {
    let mut score: i64 = 0;
    if vendor_of(requested_id) == vendor_of(&candidate.id) {
        score += 50;
    }
    if family_of(requested_id) == family_of(&candidate.id) {
        score += 80;
    }
    if is_codex_variant(requested_id) == is_codex_variant(&candidate.id) {
        score += 15;
    }
    let prefix = shared_prefix_len(requested_id, &candidate.id).min(40);
    score += prefix as i64;
    if !candidate.is_preview {
        score += 5;
    }
    score
}

/// Selects the best-scoring sibling that supports the endpoint the request
/// actually needs, when the requested model doesn't (§4.11, "endpoint not
/// supported for this model").
pub fn select_endpoint_fallback<'a>(
    requested_id: &str,
    candidates: &'a [ModelDescriptor],
) -> Option<&'a ModelDescriptor> {
    candidates
        .iter()
        .filter(|c| c.supports_endpoint && c.id != requested_id)
        .max_by_key(|c| score_sibling(requested_id, c))
}

/// Picks the first available model from the user's declared fallback chain
/// for `requested_id`, used when a capacity/rate-limit-class failure occurs
/// and the user has enabled model fallback (§4.11).
pub fn select_chain_fallback<'a>(
    requested_id: &str,
    chain: &'a std::collections::HashMap<String, Vec<String>>,
    is_available: impl Fn(&str) -> bool,
) -> Option<&'a str> {
    chain
        .get(requested_id)?
        .iter()
        .find(|candidate| is_available(candidate))
        .map(|s| s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec_set() {
        for s in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(s));
        }
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn abort_error_is_never_retried() {
        assert!(!is_retryable_network_error("AbortError: the operation was aborted"));
    }

    #[test]
    fn network_class_errors_are_retried() {
        for msg in ["connection reset by peer", "ECONNREFUSED", "request timed out", "dns lookup failed", "fetch failed"] {
            assert!(is_retryable_network_error(msg), "{msg}");
        }
    }

    #[test]
    fn retry_after_parses_plain_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_parses_http_date() {
        let future = (chrono::Utc::now() + chrono::Duration::seconds(10)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed.as_secs() <= 10);
    }

    #[test]
    fn policy_exhausts_after_max_attempts() {
        let mut policy = RetryPolicy::new();
        assert!(policy.next_delay(None).is_some());
        assert!(policy.next_delay(None).is_some());
        assert!(policy.next_delay(None).is_none());
        assert!(policy.exhausted());
    }

    #[test]
    fn retry_after_overrides_computed_backoff_capped_at_max() {
        let mut policy = RetryPolicy::new();
        let delay = policy.next_delay(Some(Duration::from_secs(60))).unwrap();
        assert_eq!(delay, MAX_DELAY);
    }

    #[test]
    fn quota_exhaustion_is_remapped_to_402() {
        assert_eq!(remap_quota_exhaustion(429, Some("insufficient_quota"), ""), 402);
        assert_eq!(remap_quota_exhaustion(429, None, "You have no quota remaining"), 402);
        assert_eq!(remap_quota_exhaustion(429, None, "rate limited, try later"), 429);
        assert_eq!(remap_quota_exhaustion(500, Some("insufficient_quota"), ""), 500);
    }

    #[test]
    fn normalize_strips_codex_suffix_and_dated_suffix() {
        assert_eq!(normalize_model_id("gpt-5-codex-mini"), "gpt-5-codex");
        assert_eq!(normalize_model_id("gpt-4o-2024-08-06"), "gpt-4o");
    }

    #[test]
    fn endpoint_fallback_prefers_same_family_and_supported_endpoint() {
        let candidates = vec![
            ModelDescriptor { id: "gpt-5-mini".into(), supports_endpoint: true, is_preview: false },
            ModelDescriptor { id: "claude-opus-4".into(), supports_endpoint: true, is_preview: false },
            ModelDescriptor { id: "gpt-5".into(), supports_endpoint: false, is_preview: false },
        ];
        let best = select_endpoint_fallback("gpt-5-codex", &candidates).unwrap();
        assert_eq!(best.id, "gpt-5-mini");
    }

    #[test]
    fn chain_fallback_picks_first_available_candidate() {
        let mut chain = std::collections::HashMap::new();
        chain.insert("gpt-5".to_string(), vec!["gpt-5-mini".to_string(), "gpt-4.1".to_string()]);
        let picked = select_chain_fallback("gpt-5", &chain, |id| id == "gpt-4.1");
        assert_eq!(picked, Some("gpt-4.1"));
    }
}
