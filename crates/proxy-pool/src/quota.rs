use proxy_core::credential::{PauseReason, QuotaSnapshot, QUOTA_PAUSE_THRESHOLD_PCT};
use proxy_core::{now_unix, CredentialRecord, NotificationSink, Notification, ProxyError};

use crate::store::PoolState;

/// Per-credential remaining-quota tracking and the auto-pause/resume and
/// monthly-reset rules that run after every fetch (C2).
pub struct QuotaTracker;

impl QuotaTracker {
    /// RPC to the upstream usage endpoint. The transport is injected as a
    /// closure so this crate stays free of a hard dependency on any specific
    /// usage-endpoint wire format; callers (the orchestrator) supply the
    /// actual HTTP call.
    pub async fn fetch(
        state: &mut PoolState,
        credential_id: &str,
        fetch_fn: impl FnOnce(&CredentialRecord) -> futures_fetch_result::FetchFuture,
    ) -> Result<(), ProxyError> {
        let cred = state
            .credentials
            .iter()
            .find(|c| c.id == credential_id)
            .ok_or_else(|| ProxyError::Internal(format!("unknown credential {credential_id}")))?;
        let snapshot = fetch_fn(cred).await?;
        // Write back by id lookup, never by holding the earlier immutable
        // borrow across the await point (a concurrent pool mutation could
        // have reordered or removed entries in the meantime).
        if let Some(cred) = state.credentials.iter_mut().find(|c| c.id == credential_id) {
            cred.quota = Some(snapshot);
        }
        Ok(())
    }

    /// Evaluate auto-pause/resume for every credential not manually paused.
    pub async fn run_auto_pause<S: NotificationSink + ?Sized>(
        state: &mut PoolState,
        sink: &S,
        auto_rotation_enabled: bool,
        auto_rotation_threshold_pct: f64,
    ) -> Vec<String> {
        let mut should_rotate_for: Vec<String> = Vec::new();
        let current_id = state
            .last_selected_id
            .clone()
            .or_else(|| state.sticky_id.clone());

        for cred in state.credentials.iter_mut() {
            if cred.paused && cred.pause_reason != Some(PauseReason::Quota) {
                continue; // manually paused, auto-pause logic does not touch it
            }
            let pct = cred.effective_percent();
            if pct <= QUOTA_PAUSE_THRESHOLD_PCT && !cred.paused {
                cred.paused = true;
                cred.pause_reason = Some(PauseReason::Quota);
                sink.notify(Notification {
                    credential_id: cred.id.clone(),
                    kind: "quota_pause".into(),
                    message: format!("{} paused: effective quota {pct:.1}%", cred.label),
                    at: now_unix(),
                })
                .await;
                if Some(&cred.id) == current_id.as_ref()
                    && auto_rotation_enabled
                    && pct <= auto_rotation_threshold_pct
                {
                    should_rotate_for.push(cred.id.clone());
                }
            } else if pct > QUOTA_PAUSE_THRESHOLD_PCT
                && cred.paused
                && cred.pause_reason == Some(PauseReason::Quota)
            {
                cred.paused = false;
                cred.pause_reason = None;
            }
        }
        should_rotate_for
    }

    /// Track the last-observed calendar month; on a month rollover clear every
    /// quota-pause flag and snapshot, returning true if a reset occurred.
    pub fn run_monthly_reset(state: &mut PoolState, year: i32, month: u32) -> bool {
        let observed = (year as i64) * 12 + month as i64;
        match state.last_reset_month {
            None => {
                state.last_reset_month = Some(observed);
                false
            }
            Some(last) if observed > last => {
                state.last_reset_month = Some(observed);
                for cred in state.credentials.iter_mut() {
                    if cred.pause_reason == Some(PauseReason::Quota) {
                        cred.paused = false;
                        cred.pause_reason = None;
                    }
                    cred.quota = None;
                }
                true
            }
            _ => false,
        }
    }
}

/// Thin module boundary so `QuotaTracker::fetch` can accept a boxed async
/// closure without pinning this crate to one HTTP client type at the
/// signature level. The orchestrator crate fills this in concretely.
pub mod futures_fetch_result {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;

    pub type FetchFuture = Pin<Box<dyn Future<Output = Result<QuotaSnapshot, ProxyError>> + Send>>;
}
