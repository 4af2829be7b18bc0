use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    QuotaBased,
    Hybrid,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Sticky
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Effective-percent threshold below which auto-rotation fires on its own (in addition
    /// to the always-fire rate-limit/quota cases).
    #[serde(default = "default_auto_rotation_threshold")]
    pub auto_rotation_threshold_pct: f64,
    #[serde(default = "default_rotation_cooldown_minutes")]
    pub auto_rotation_cooldown_minutes: i64,
    #[serde(default = "default_error_threshold")]
    pub error_count_threshold: u64,
}

fn default_true() -> bool {
    true
}
fn default_auto_rotation_threshold() -> f64 {
    10.0
}
fn default_rotation_cooldown_minutes() -> i64 {
    5
}
fn default_error_threshold() -> u64 {
    3
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            strategy: SelectionStrategy::default(),
            enabled: true,
            auto_rotation_threshold_pct: default_auto_rotation_threshold(),
            auto_rotation_cooldown_minutes: default_rotation_cooldown_minutes(),
            error_count_threshold: default_error_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: i64,
}

fn default_cache_max_size() -> usize {
    500
}
fn default_cache_ttl_secs() -> i64 {
    5 * 60
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            max_size: default_cache_max_size(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_queue_size() -> usize {
    100
}
fn default_item_timeout_secs() -> u64 {
    60
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            item_timeout_secs: default_item_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    /// requested model id -> ordered list of candidate fallback model ids.
    #[serde(default)]
    pub fallback_chain: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub model_fallback_enabled: bool,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_port() -> u16 {
    11434
}
fn default_upstream_base_url() -> String {
    "https://api.upstream.internal".to_string()
}
fn default_rate_limit_interval_ms() -> u64 {
    0
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            upstream_base_url: default_upstream_base_url(),
            pool: PoolSettings::default(),
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            fallback_chain: HashMap::new(),
            model_fallback_enabled: false,
            cache: CacheSettings::default(),
            queue: QueueSettings::default(),
            webhook: WebhookSettings::default(),
            api_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Directory holding all persisted proxy state (`config.json`, `account-pool.json`, ...).
    pub fn state_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("code-proxy")
    }

    /// Loads `config.json` from the state dir, falling back to defaults when the file is
    /// missing. A present-but-corrupt file is a hard error (unlike the credential store's
    /// load, which treats corruption as an empty pool) since a bad config is an operator
    /// mistake worth surfacing rather than silently discarding.
    pub fn load() -> Result<Self, ProxyError> {
        Self::load_from(&Self::state_dir().join("config.json"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ProxyError> {
        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Layers the recognized environment variables over the file-loaded config
    /// (`PORT`, `API_KEYS`, `FALLBACK`, `UPSTREAM_BASE_URL`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            if !url.trim().is_empty() {
                self.upstream_base_url = url;
            }
        }
        if let Ok(keys) = std::env::var("API_KEYS") {
            let mut extra: Vec<String> = keys
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            self.api_keys.append(&mut extra);
        }
        if std::env::var("FALLBACK").map(|v| v == "1" || v == "true").unwrap_or(false) {
            self.model_fallback_enabled = true;
        }
    }

    /// The full accepted-key set: config file keys unioned with `API_KEYS` env (already
    /// merged in by `apply_env_overrides`). Authentication is disabled when this is empty.
    pub fn accepted_keys(&self) -> &[String] {
        &self.api_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg.port, default_port());
        assert!(cfg.api_keys.is_empty());
    }

    #[test]
    fn loads_partial_json_with_defaults_filled_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000}"#).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.queue.max_concurrent, default_max_concurrent());
    }

    #[test]
    fn corrupt_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
