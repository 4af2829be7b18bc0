use std::fs;
use std::path::{Path, PathBuf};

use proxy_core::config::SelectionStrategy;
use proxy_core::CredentialRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pool state (C3), persisted verbatim to `account-pool.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub credentials: Vec<CredentialRecord>,
    pub cursor: usize,
    pub sticky_id: Option<String>,
    pub last_selected_id: Option<String>,
    pub last_auto_rotation_at: Option<i64>,
    /// `year * 12 + month`, persisted so a process restart across a month
    /// boundary does not skip the monthly reset (design note, resolved open
    /// question: the in-process-only variable is a bug).
    pub last_reset_month: Option<i64>,
    pub enabled: bool,
    pub strategy: SelectionStrategy,
}

impl Default for PoolState {
    fn default() -> Self {
        PoolState {
            credentials: Vec::new(),
            cursor: 0,
            sticky_id: None,
            last_selected_id: None,
            last_auto_rotation_at: None,
            last_reset_month: None,
            enabled: true,
            strategy: SelectionStrategy::default(),
        }
    }
}

/// Durable storage of credential records and pool metadata (C1).
///
/// On load, missing or corrupt state yields an empty pool — this is not an
/// error; a cache that has never been populated or that failed to parse
/// should never fail the caller just because nothing useful was on disk.
/// Saves are atomic: write to a temp file in the same directory, then
/// rename, so a crash mid-write never leaves a half-written state file.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        CredentialStore { path }
    }

    pub fn load(&self) -> PoolState {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %self.path.display(), "corrupt pool state, starting empty");
                PoolState::default()
            }),
            Err(_) => PoolState::default(),
        }
    }

    /// Best-effort save: failures are logged, never propagated, matching the
    /// spec's "saves are best-effort" requirement for C1.
    pub fn save(&self, state: &PoolState) {
        if let Err(e) = self.save_atomic(state) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist pool state");
        }
    }

    fn save_atomic(&self, state: &PoolState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        tmp.set_extension("json.tmp");
        tmp
    }
}

/// The one-way sync hook: mirrors the minimal set (token, label) of newly
/// added credentials into the user-visible configuration file. The config
/// file itself is an external collaborator (out of scope); this trait is the
/// seam a concrete implementation plugs into.
pub trait ConfigMirror: Send + Sync {
    fn mirror_credential(&self, id: &str, label: &str, token: &str);
}

/// No-op mirror used when no config-file sync is configured.
pub struct NullConfigMirror;

impl ConfigMirror for NullConfigMirror {
    fn mirror_credential(&self, _id: &str, _label: &str, _token: &str) {}
}

pub fn state_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("account-pool.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("account-pool.json"));
        let state = store.load();
        assert!(state.credentials.is_empty());
    }

    #[test]
    fn corrupt_file_yields_empty_pool_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account-pool.json");
        fs::write(&path, "{ not json").unwrap();
        let store = CredentialStore::new(path);
        let state = store.load();
        assert!(state.credentials.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("account-pool.json"));
        let mut state = PoolState::default();
        state
            .credentials
            .push(CredentialRecord::new("id1", "Account 1", "secret"));
        state.sticky_id = Some("id1".into());
        store.save(&state);

        let loaded = store.load();
        assert_eq!(loaded.credentials.len(), 1);
        assert_eq!(loaded.sticky_id.as_deref(), Some("id1"));
    }

    #[test]
    fn save_does_not_leave_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account-pool.json");
        let store = CredentialStore::new(path.clone());
        store.save(&PoolState::default());
        assert!(path.exists());
        assert!(!store.tmp_path().exists());
    }
}
