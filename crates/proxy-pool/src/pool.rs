use std::sync::Arc;

use proxy_core::config::{PoolSettings, SelectionStrategy};
use proxy_core::credential::{CredentialRecord, ErrorKind, PauseReason};
use proxy_core::{now_unix, Notification, NotificationSink, ProxyError};
use tokio::sync::Mutex;

use crate::quota::futures_fetch_result::FetchFuture;
use crate::quota::QuotaTracker;
use crate::store::{CredentialStore, PoolState};
use crate::token::ensure_fresh_token;

/// Cached active-set view alongside the persisted state. Invalidated (set to
/// `None`) on every mutation that could change membership; recomputed lazily
/// on the next read. This is the "pool maintains a cached view of the active
/// set" requirement from C3.
struct Inner {
    state: PoolState,
    active_cache: Option<Vec<usize>>,
}

/// Selection, rotation, and error-reporting over a pool of credentials (C3),
/// guarded by a single `tokio::sync::Mutex` so two concurrent dispatches
/// never observe an inconsistent `{sticky_id, cursor, last_selected_id}`
/// triple.
pub struct AccountPool {
    inner: Mutex<Inner>,
    store: CredentialStore,
    settings: PoolSettings,
    sink: Arc<dyn NotificationSink>,
}

impl AccountPool {
    pub fn new(store: CredentialStore, settings: PoolSettings, sink: Arc<dyn NotificationSink>) -> Self {
        let state = store.load();
        AccountPool {
            inner: Mutex::new(Inner {
                state,
                active_cache: None,
            }),
            store,
            settings,
            sink,
        }
    }

    fn persist(&self, state: &PoolState) {
        self.store.save(state);
    }

    /// Recomputes (if needed) and returns the indices of `state.credentials`
    /// currently in the active set: active AND not rate-limited AND not paused.
    fn active_indices(inner: &mut Inner) -> Vec<usize> {
        if let Some(cached) = &inner.active_cache {
            return cached.clone();
        }
        let active: Vec<usize> = inner
            .state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_eligible())
            .map(|(i, _)| i)
            .collect();
        inner.active_cache = Some(active.clone());
        active
    }

    /// Tries to bring rate-limited credentials whose reset has passed back
    /// into the active set. Returns the first such credential's index, if any.
    fn reset_expired_rate_limits(state: &mut PoolState, now: i64) -> Option<usize> {
        let mut first = None;
        for (i, cred) in state.credentials.iter_mut().enumerate() {
            if cred.rate_limited {
                if let Some(reset_at) = cred.rate_limit_reset_at {
                    if reset_at <= now {
                        cred.rate_limited = false;
                        cred.rate_limit_reset_at = None;
                        if first.is_none() && cred.is_eligible() {
                            first = Some(i);
                        }
                    }
                }
            }
        }
        first
    }

    fn select_locked(inner: &mut Inner, settings: &PoolSettings, now: i64) -> Option<CredentialRecord> {
        let mut active = Self::active_indices(inner);

        if active.is_empty() {
            match Self::reset_expired_rate_limits(&mut inner.state, now) {
                Some(idx) => {
                    inner.active_cache = None;
                    active = Self::active_indices(inner);
                    if !active.contains(&idx) {
                        return None;
                    }
                }
                None => return None,
            }
        }

        let chosen_idx = match settings.strategy {
            SelectionStrategy::Sticky | SelectionStrategy::Hybrid => {
                if let Some(sticky_id) = &inner.state.sticky_id {
                    if let Some(&idx) = active
                        .iter()
                        .find(|&&i| &inner.state.credentials[i].id == sticky_id)
                    {
                        idx
                    } else {
                        let idx = active[0];
                        inner.state.sticky_id = Some(inner.state.credentials[idx].id.clone());
                        idx
                    }
                } else {
                    let idx = active[0];
                    inner.state.sticky_id = Some(inner.state.credentials[idx].id.clone());
                    idx
                }
            }
            SelectionStrategy::RoundRobin => {
                let idx = active[inner.state.cursor % active.len()];
                inner.state.cursor = inner.state.cursor.wrapping_add(1);
                idx
            }
            SelectionStrategy::QuotaBased => *active
                .iter()
                .max_by(|&&a, &&b| {
                    inner.state.credentials[a]
                        .effective_percent()
                        .partial_cmp(&inner.state.credentials[b].effective_percent())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap(),
        };

        let chosen = inner.state.credentials[chosen_idx].clone();
        inner.state.last_selected_id = Some(chosen.id.clone());
        Some(chosen)
    }

    pub async fn select(&self) -> Option<CredentialRecord> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let result = Self::select_locked(&mut inner, &self.settings, now);
        self.persist(&inner.state);
        result
    }

    /// Ranks active candidates (excluding `exclude_id`) by effective-percent
    /// descending; used both directly and by rotation.
    pub async fn find_next_available(&self, exclude_id: &str) -> Option<CredentialRecord> {
        let mut inner = self.inner.lock().await;
        let active = Self::active_indices(&mut inner);
        let best = active
            .into_iter()
            .filter(|&i| inner.state.credentials[i].id != exclude_id)
            .max_by(|&a, &b| {
                inner.state.credentials[a]
                    .effective_percent()
                    .partial_cmp(&inner.state.credentials[b].effective_percent())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        best.map(|i| inner.state.credentials[i].clone())
    }

    pub async fn get_current(&self) -> Option<CredentialRecord> {
        let inner = self.inner.lock().await;
        let id = inner
            .state
            .last_selected_id
            .clone()
            .or_else(|| inner.state.sticky_id.clone())?;
        inner.state.credentials.iter().find(|c| c.id == id).cloned()
    }

    pub async fn set_current(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.state.last_selected_id = Some(id.to_string());
        inner.state.sticky_id = Some(id.to_string());
        self.persist(&inner.state);
    }

    /// Records an error against the "current" credential and applies the
    /// per-kind flag transition, then runs auto-rotation when applicable.
    pub async fn report_error(&self, kind: ErrorKind, reset_at: Option<i64>) {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let current_id = inner
            .state
            .last_selected_id
            .clone()
            .or_else(|| inner.state.sticky_id.clone());

        let current_id = match current_id {
            Some(id) => id,
            None => match Self::select_locked(&mut inner, &self.settings, now) {
                Some(c) => c.id,
                None => return,
            },
        };

        let mut should_rotate = false;
        let mut notify: Option<Notification> = None;

        if let Some(cred) = inner
            .state
            .credentials
            .iter_mut()
            .find(|c| c.id == current_id)
        {
            cred.errors_observed += 1;
            cred.last_error_kind = Some(kind);
            match kind {
                ErrorKind::RateLimit => {
                    cred.rate_limited = true;
                    cred.rate_limit_reset_at = Some(reset_at.unwrap_or(now + 60));
                    notify = Some(Notification {
                        credential_id: cred.id.clone(),
                        kind: "rate_limited".into(),
                        message: format!("{} rate limited", cred.label),
                        at: now,
                    });
                    should_rotate = true;
                }
                ErrorKind::Quota => {
                    cred.paused = true;
                    cred.pause_reason = Some(PauseReason::Quota);
                    cred.rate_limited = false;
                    cred.rate_limit_reset_at = None;
                    should_rotate = true;
                }
                ErrorKind::Auth => {
                    cred.active = false;
                    notify = Some(Notification {
                        credential_id: cred.id.clone(),
                        kind: "auth_failed".into(),
                        message: format!("{} deactivated: auth error", cred.label),
                        at: now,
                    });
                }
                ErrorKind::Other => {
                    should_rotate = cred.errors_observed >= self.settings.error_count_threshold;
                }
            }
        }
        if self.settings.strategy == SelectionStrategy::Hybrid {
            should_rotate = true;
        }
        inner.active_cache = None;

        if should_rotate {
            self.rotate_locked(&mut inner, &current_id, now);
        }

        self.persist(&inner.state);
        drop(inner);

        if let Some(n) = notify {
            self.sink.notify(n).await;
        }
    }

    /// Rotation honors a cooldown: it must not fire twice within the
    /// configured number of minutes.
    fn rotate_locked(&self, inner: &mut Inner, current_id: &str, now: i64) {
        if let Some(last) = inner.state.last_auto_rotation_at {
            let cooldown_secs = self.settings.auto_rotation_cooldown_minutes * 60;
            if now - last < cooldown_secs {
                return;
            }
        }
        let active = Self::active_indices(inner);
        let best = active
            .into_iter()
            .filter(|&i| inner.state.credentials[i].id != current_id)
            .max_by(|&a, &b| {
                inner.state.credentials[a]
                    .effective_percent()
                    .partial_cmp(&inner.state.credentials[b].effective_percent())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(idx) = best {
            let new_id = inner.state.credentials[idx].id.clone();
            inner.state.sticky_id = Some(new_id.clone());
            inner.state.last_selected_id = Some(new_id);
            inner.state.cursor = inner.state.cursor.wrapping_add(1);
            inner.state.last_auto_rotation_at = Some(now);
        }
    }

    /// Selects a credential and ensures it has a fresh session token,
    /// retrying past credentials whose token refresh fails. Bounded by
    /// `len(pool) + 1` attempts with already-tried ids tracked, so the loop
    /// always terminates (the selection-recursion guard from C3).
    pub async fn select_with_token<F, Fut>(&self, exchange: F) -> Result<(CredentialRecord, String), ProxyError>
    where
        F: Fn(&CredentialRecord) -> Fut,
        Fut: std::future::Future<Output = Result<(String, i64), ProxyError>>,
    {
        let max_attempts = {
            let inner = self.inner.lock().await;
            inner.state.credentials.len() + 1
        };
        let mut tried = std::collections::HashSet::new();

        for _ in 0..max_attempts {
            let candidate = {
                let mut inner = self.inner.lock().await;
                let now = now_unix();
                let active = Self::active_indices(&mut inner);
                let pick = active
                    .into_iter()
                    .find(|&i| !tried.contains(&inner.state.credentials[i].id));
                match pick {
                    Some(idx) => {
                        let chosen = inner.state.credentials[idx].clone();
                        inner.state.last_selected_id = Some(chosen.id.clone());
                        self.persist(&inner.state);
                        drop(inner);
                        chosen
                    }
                    None => {
                        // fall back to the normal selector (honors sticky/round-robin)
                        match Self::select_locked(&mut inner, &self.settings, now) {
                            Some(c) if !tried.contains(&c.id) => {
                                self.persist(&inner.state);
                                c
                            }
                            _ => return Err(ProxyError::NoAccountsAvailable),
                        }
                    }
                }
            };

            tried.insert(candidate.id.clone());
            let mut cred = candidate;
            match ensure_fresh_token(&mut cred, &exchange).await {
                Ok(token) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(slot) = inner
                        .state
                        .credentials
                        .iter_mut()
                        .find(|c| c.id == cred.id)
                    {
                        *slot = cred.clone();
                    }
                    self.persist(&inner.state);
                    return Ok((cred, token));
                }
                Err(_) => {
                    let mut inner = self.inner.lock().await;
                    if let Some(slot) = inner
                        .state
                        .credentials
                        .iter_mut()
                        .find(|c| c.id == cred.id)
                    {
                        slot.active = false;
                    }
                    inner.active_cache = None;
                    self.persist(&inner.state);
                    continue;
                }
            }
        }
        Err(ProxyError::NoAccountsAvailable)
    }

    pub async fn refresh_all_tokens<F, Fut>(&self, exchange: F)
    where
        F: Fn(&CredentialRecord) -> Fut,
        Fut: std::future::Future<Output = Result<(String, i64), ProxyError>>,
    {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.state.credentials.iter().map(|c| c.id.clone()).collect()
        };
        for id in ids {
            let mut cred = {
                let inner = self.inner.lock().await;
                match inner.state.credentials.iter().find(|c| c.id == id).cloned() {
                    Some(c) => c,
                    None => continue,
                }
            };
            let refreshed = ensure_fresh_token(&mut cred, &exchange).await;
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.state.credentials.iter_mut().find(|c| c.id == id) {
                if refreshed.is_ok() {
                    *slot = cred;
                } else {
                    slot.active = false;
                }
            }
            inner.active_cache = None;
            self.persist(&inner.state);
        }
    }

    /// Periodic C2 maintenance: refresh any credential whose quota snapshot
    /// is stale, then run the auto-pause/resume rule and the monthly-reset
    /// rule over the whole pool, rotating away from any credential the
    /// auto-pause pass flagged. Called on a timer from the service binary
    /// (§4.2); also the natural place the month-boundary persistence fix
    /// (DESIGN.md open question 3) takes effect, since `last_reset_month`
    /// lives in the same `PoolState` this method already persists.
    pub async fn run_quota_maintenance<F>(&self, fetch_fn: F, year: i32, month: u32)
    where
        F: Fn(&CredentialRecord) -> FetchFuture,
    {
        let now = now_unix();
        let stale_ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .state
                .credentials
                .iter()
                .filter(|c| c.needs_quota_refresh(now))
                .map(|c| c.id.clone())
                .collect()
        };

        for id in stale_ids {
            let mut inner = self.inner.lock().await;
            let _ = QuotaTracker::fetch(&mut inner.state, &id, &fetch_fn).await;
        }

        let mut inner = self.inner.lock().await;
        QuotaTracker::run_monthly_reset(&mut inner.state, year, month);
        let should_rotate_for = QuotaTracker::run_auto_pause(
            &mut inner.state,
            self.sink.as_ref(),
            self.settings.enabled,
            self.settings.auto_rotation_threshold_pct,
        )
        .await;
        inner.active_cache = None;
        for id in should_rotate_for {
            self.rotate_locked(&mut inner, &id, now);
        }
        self.persist(&inner.state);
    }

    pub async fn add_credential(&self, cred: CredentialRecord, mirror: &dyn crate::store::ConfigMirror) {
        let mut inner = self.inner.lock().await;
        mirror.mirror_credential(&cred.id, &cred.label, &cred.credential);
        inner.state.credentials.push(cred);
        inner.active_cache = None;
        self.persist(&inner.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::InMemoryNotifier;

    fn settings(strategy: SelectionStrategy) -> PoolSettings {
        PoolSettings {
            strategy,
            enabled: true,
            auto_rotation_threshold_pct: 10.0,
            auto_rotation_cooldown_minutes: 5,
            error_count_threshold: 3,
        }
    }

    fn pool_with(strategy: SelectionStrategy, creds: Vec<CredentialRecord>) -> AccountPool {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("account-pool.json"));
        let mut state = PoolState::default();
        state.credentials = creds;
        store.save(&state);
        AccountPool::new(store, settings(strategy), Arc::new(InMemoryNotifier::default()))
    }

    #[tokio::test]
    async fn empty_pool_selects_none() {
        let pool = pool_with(SelectionStrategy::Sticky, vec![]);
        assert!(pool.select().await.is_none());
    }

    #[tokio::test]
    async fn sticky_strategy_sticks_to_first_pick() {
        let pool = pool_with(
            SelectionStrategy::Sticky,
            vec![
                CredentialRecord::new("a", "A", "sa"),
                CredentialRecord::new("b", "B", "sb"),
            ],
        );
        let first = pool.select().await.unwrap();
        let second = pool.select().await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn round_robin_advances_each_call() {
        let pool = pool_with(
            SelectionStrategy::RoundRobin,
            vec![
                CredentialRecord::new("a", "A", "sa"),
                CredentialRecord::new("b", "B", "sb"),
            ],
        );
        let first = pool.select().await.unwrap();
        let second = pool.select().await.unwrap();
        assert_ne!(first.id, second.id);
        let third = pool.select().await.unwrap();
        assert_eq!(first.id, third.id);
    }

    #[tokio::test]
    async fn quota_based_prefers_highest_effective_percent() {
        use proxy_core::credential::{QuotaBucket, QuotaSnapshot};
        let mut a = CredentialRecord::new("a", "A", "sa");
        a.quota = Some(QuotaSnapshot {
            chat: QuotaBucket { remaining: 0, entitlement: 0, percent_remaining: 20.0, unlimited: false },
            completions: QuotaBucket::default(),
            premium_interactions: QuotaBucket { remaining: 0, entitlement: 0, percent_remaining: 20.0, unlimited: false },
            reset_date: "x".into(),
            fetched_at: now_unix(),
        });
        let mut b = CredentialRecord::new("b", "B", "sb");
        b.quota = Some(QuotaSnapshot {
            chat: QuotaBucket { remaining: 0, entitlement: 0, percent_remaining: 80.0, unlimited: false },
            completions: QuotaBucket::default(),
            premium_interactions: QuotaBucket { remaining: 0, entitlement: 0, percent_remaining: 80.0, unlimited: false },
            reset_date: "x".into(),
            fetched_at: now_unix(),
        });
        let pool = pool_with(SelectionStrategy::QuotaBased, vec![a, b]);
        let chosen = pool.select().await.unwrap();
        assert_eq!(chosen.id, "b");
    }

    #[tokio::test]
    async fn rate_limit_error_marks_credential_and_rotates() {
        let pool = pool_with(
            SelectionStrategy::Sticky,
            vec![
                CredentialRecord::new("a", "A", "sa"),
                CredentialRecord::new("b", "B", "sb"),
            ],
        );
        pool.select().await.unwrap();
        pool.report_error(ErrorKind::RateLimit, Some(now_unix() + 60)).await;

        let current = pool.get_current().await.unwrap();
        assert_eq!(current.id, "b");
    }

    #[tokio::test]
    async fn rate_limited_credential_excluded_until_reset_passes() {
        let pool = pool_with(SelectionStrategy::Sticky, vec![CredentialRecord::new("a", "A", "sa")]);
        pool.select().await.unwrap();
        pool.report_error(ErrorKind::RateLimit, Some(now_unix() - 1)).await;
        // reset_at already in the past: next select should bring it back
        let again = pool.select().await;
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn auth_error_deactivates_without_rotation_flag_forcing() {
        let pool = pool_with(SelectionStrategy::Sticky, vec![CredentialRecord::new("a", "A", "sa")]);
        pool.select().await.unwrap();
        pool.report_error(ErrorKind::Auth, None).await;
        assert!(pool.select().await.is_none());
    }
}
