use std::fs;
use std::path::PathBuf;

use proxy_core::now_unix;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const MAX_HISTORY_ENTRIES: usize = 1000;
const HISTORY_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

/// Outcome recorded for a single orchestrated request (§4.10/§7): every exit
/// path of the orchestrator — cache hit, success, cancellation, error —
/// writes exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Cached,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub model: String,
    pub credential_id: Option<String>,
    pub status: RequestStatus,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: i64,
}

/// Cost entries plus any operator-declared per-model pricing overrides.
/// Pricing *tables* are out of scope; this only owns the call site that
/// records what a request cost once pricing has been looked up elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostHistory {
    pub entries: Vec<CostEntry>,
    #[serde(default)]
    pub pricing_overrides: std::collections::HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub request_id: String,
    pub model: String,
    pub cost: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// A trait seam for cost calculation: pricing *tables* are an external
/// collaborator, but the orchestrator still needs a call site to compute a
/// cost figure for the history record.
pub trait CostCalculator: Send + Sync {
    fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64;
}

/// Zero-cost stand-in used when no pricing table is configured.
pub struct ZeroCostCalculator;

impl CostCalculator for ZeroCostCalculator {
    fn cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> f64 {
        0.0
    }
}

/// Recent request history, capped at `MAX_HISTORY_ENTRIES` and 7-day
/// retention (§6), persisted alongside the account pool and cache.
pub struct RequestHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl RequestHistory {
    pub fn new() -> Self {
        RequestHistory { entries: Mutex::new(Vec::new()) }
    }

    pub async fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().await;
        entries.push(entry);
        let now = now_unix();
        entries.retain(|e| now - e.created_at <= HISTORY_RETENTION_SECS);
        if entries.len() > MAX_HISTORY_ENTRIES {
            let overflow = entries.len() - MAX_HISTORY_ENTRIES;
            entries.drain(0..overflow);
        }
    }

    pub async fn recent(&self) -> Vec<HistoryEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn load(path: &PathBuf) -> Self {
        let history = RequestHistory::new();
        if let Ok(raw) = fs::read_to_string(path) {
            if let Ok(entries) = serde_json::from_str::<Vec<HistoryEntry>>(&raw) {
                *history.entries.lock().await = entries;
            }
        }
        history
    }

    pub async fn persist(&self, path: &PathBuf) {
        let entries = self.entries.lock().await;
        if let Ok(json) = serde_json::to_string_pretty(&*entries) {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = fs::write(path, json) {
                tracing::warn!(error = %e, path = %path.display(), "failed to persist request history");
            }
        }
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        RequestHistory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, at: i64) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            model: "gpt-4.1".to_string(),
            credential_id: Some("acc-1".to_string()),
            status: RequestStatus::Success,
            cost: 0.0,
            input_tokens: 10,
            output_tokens: 5,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn caps_at_max_entries() {
        let history = RequestHistory::new();
        for i in 0..(MAX_HISTORY_ENTRIES + 10) {
            history.record(entry(&i.to_string(), now_unix())).await;
        }
        assert_eq!(history.recent().await.len(), MAX_HISTORY_ENTRIES);
    }

    #[tokio::test]
    async fn drops_entries_past_retention_window() {
        let history = RequestHistory::new();
        history.record(entry("old", 0)).await;
        history.record(entry("new", now_unix())).await;
        let recent = history.recent().await;
        assert!(recent.iter().any(|e| e.id == "new"));
        assert!(!recent.iter().any(|e| e.id == "old"));
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request-history.json");
        let history = RequestHistory::new();
        history.record(entry("a", now_unix())).await;
        history.persist(&path).await;

        let loaded = RequestHistory::load(&path).await;
        assert_eq!(loaded.recent().await.len(), 1);
    }

    #[test]
    fn zero_cost_calculator_always_returns_zero() {
        let calc = ZeroCostCalculator;
        assert_eq!(calc.cost("gpt-4.1", 1000, 500), 0.0);
    }
}
