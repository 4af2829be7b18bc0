use serde::{Deserialize, Serialize};

/// Interval after which a quota snapshot is considered stale (spec: 5 minutes).
pub const QUOTA_REFRESH_INTERVAL_SECS: i64 = 5 * 60;

/// The auto-pause threshold: effective-percent at or below this pauses the credential.
pub const QUOTA_PAUSE_THRESHOLD_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    Quota,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Quota,
    Auth,
    Other,
}

/// One of the three quota buckets a credential is billed against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct QuotaBucket {
    pub remaining: i64,
    pub entitlement: i64,
    pub percent_remaining: f64,
    pub unlimited: bool,
}

/// A point-in-time read of a credential's remaining quota (C2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaSnapshot {
    pub chat: QuotaBucket,
    pub completions: QuotaBucket,
    pub premium_interactions: QuotaBucket,
    pub reset_date: String,
    pub fetched_at: i64,
}

impl QuotaSnapshot {
    /// True when this snapshot is older than the refresh interval.
    pub fn is_stale(&self, now_unix: i64) -> bool {
        now_unix - self.fetched_at > QUOTA_REFRESH_INTERVAL_SECS
    }

    /// The minimum of the non-unlimited bucket percentages among {chat, premium}.
    /// `completions` is never consulted for selection purposes.
    pub fn effective_percent(&self) -> f64 {
        let mut candidates = Vec::with_capacity(2);
        if !self.chat.unlimited {
            candidates.push(self.chat.percent_remaining);
        }
        if !self.premium_interactions.unlimited {
            candidates.push(self.premium_interactions.percent_remaining);
        }
        if candidates.is_empty() {
            100.0
        } else {
            candidates.into_iter().fold(f64::INFINITY, f64::min)
        }
    }
}

/// A durable record of one upstream credential, owned exclusively by the pool (C1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub label: String,
    pub credential: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token_expires_at: Option<i64>,
    pub requests_issued: u64,
    pub errors_observed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<i64>,
    pub active: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>, label: impl Into<String>, credential: impl Into<String>) -> Self {
        CredentialRecord {
            id: id.into(),
            label: label.into(),
            credential: credential.into(),
            session_token: None,
            session_token_expires_at: None,
            requests_issued: 0,
            errors_observed: 0,
            last_used_at: None,
            last_error_kind: None,
            rate_limited: false,
            rate_limit_reset_at: None,
            active: true,
            paused: false,
            pause_reason: None,
            quota: None,
        }
    }

    /// Membership test for the pool's active set: active AND not rate-limited AND not paused.
    pub fn is_eligible(&self) -> bool {
        self.active && !self.rate_limited && !self.paused
    }

    /// Effective-percent including the "no snapshot" case (100%, unknown but presumed sufficient).
    pub fn effective_percent(&self) -> f64 {
        self.quota
            .as_ref()
            .map(|q| q.effective_percent())
            .unwrap_or(100.0)
    }

    pub fn needs_quota_refresh(&self, now_unix: i64) -> bool {
        match &self.quota {
            None => true,
            Some(q) => q.is_stale(now_unix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(pct: f64, unlimited: bool) -> QuotaBucket {
        QuotaBucket {
            remaining: 0,
            entitlement: 0,
            percent_remaining: pct,
            unlimited,
        }
    }

    #[test]
    fn effective_percent_ignores_completions_bucket() {
        let snap = QuotaSnapshot {
            chat: bucket(40.0, false),
            completions: bucket(0.0, false),
            premium_interactions: bucket(60.0, false),
            reset_date: "2026-08-01".into(),
            fetched_at: 0,
        };
        assert_eq!(snap.effective_percent(), 40.0);
    }

    #[test]
    fn effective_percent_100_when_both_unlimited() {
        let snap = QuotaSnapshot {
            chat: bucket(0.0, true),
            completions: bucket(0.0, false),
            premium_interactions: bucket(0.0, true),
            reset_date: "2026-08-01".into(),
            fetched_at: 0,
        };
        assert_eq!(snap.effective_percent(), 100.0);
    }

    #[test]
    fn stale_snapshot_detected_past_refresh_interval() {
        let snap = QuotaSnapshot {
            chat: bucket(10.0, false),
            completions: bucket(0.0, false),
            premium_interactions: bucket(10.0, false),
            reset_date: "2026-08-01".into(),
            fetched_at: 0,
        };
        assert!(!snap.is_stale(100));
        assert!(snap.is_stale(QUOTA_REFRESH_INTERVAL_SECS + 1));
    }

    #[test]
    fn credential_without_snapshot_reports_full_quota() {
        let cred = CredentialRecord::new("id1", "Account 1", "secret");
        assert_eq!(cred.effective_percent(), 100.0);
        assert!(cred.needs_quota_refresh(0));
    }

    #[test]
    fn eligibility_requires_active_and_unpaused_and_not_rate_limited() {
        let mut cred = CredentialRecord::new("id1", "Account 1", "secret");
        assert!(cred.is_eligible());
        cred.paused = true;
        assert!(!cred.is_eligible());
        cred.paused = false;
        cred.rate_limited = true;
        assert!(!cred.is_eligible());
    }
}
