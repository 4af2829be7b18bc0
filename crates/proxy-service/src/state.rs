use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use proxy_core::{Config, InMemoryNotifier, NotificationSink};
use proxy_dialect::ToolIdCodec;
use proxy_pool::{AccountPool, CredentialStore};
use proxy_runtime::{RateLimiter, RequestCache, RequestQueue};
use tokio::sync::Mutex;

use crate::history::{CostHistory, RequestHistory};

/// Everything the HTTP handlers need, assembled once at startup and shared
/// behind an `Arc` (§5: the queue, cache, and pool are all process-wide).
pub struct AppState {
    pub config: Config,
    pub pool: AccountPool,
    pub cache: Mutex<RequestCache>,
    pub queue: RequestQueue,
    pub rate_limiter: RateLimiter,
    pub tool_ids: ToolIdCodec,
    pub history: RequestHistory,
    pub cost_history: Mutex<CostHistory>,
    pub notifier: Arc<dyn NotificationSink>,
    pub accepted_keys: Vec<String>,
    pub state_dir: PathBuf,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let state_dir = Config::state_dir();
        let notifier: Arc<dyn NotificationSink> = Arc::new(InMemoryNotifier::default());
        let store = CredentialStore::new(state_dir.join("account-pool.json"));
        let pool = AccountPool::new(store, config.pool.clone(), notifier.clone());
        let cache = RequestCache::load_with(
            &state_dir.join("request-cache.json"),
            config.cache.max_size,
            config.cache.ttl_secs,
        );
        let queue = RequestQueue::new(
            config.queue.enabled,
            config.queue.max_concurrent,
            config.queue.max_queue_size,
            Duration::from_secs(config.queue.item_timeout_secs),
        );
        let rate_limiter = RateLimiter::new(Duration::from_millis(config.rate_limit_interval_ms));
        let accepted_keys = config.accepted_keys().to_vec();

        AppState {
            cache: Mutex::new(cache),
            queue,
            rate_limiter,
            tool_ids: ToolIdCodec::default(),
            history: RequestHistory::new(),
            cost_history: Mutex::new(CostHistory::default()),
            notifier,
            accepted_keys,
            state_dir,
            pool,
            config,
        }
    }

    /// The account pool persists itself on every mutation; cache and history
    /// are best-effort snapshotted periodically / at shutdown instead.
    pub async fn persist(&self) {
        self.cache.lock().await.persist(&self.state_dir.join("request-cache.json"));
        self.history.persist(&self.state_dir.join("request-history.json")).await;
    }

    #[cfg(test)]
    pub fn test_with_keys(keys: Vec<String>) -> Self {
        let mut config = Config::default();
        config.api_keys = keys;
        let dir = std::env::temp_dir().join(format!("proxy-service-test-{}", uuid::Uuid::new_v4()));
        let store = CredentialStore::new(dir.join("account-pool.json"));
        let notifier: Arc<dyn NotificationSink> = Arc::new(InMemoryNotifier::default());
        let pool = AccountPool::new(store, config.pool.clone(), notifier.clone());
        AppState {
            cache: Mutex::new(RequestCache::new(config.cache.max_size, config.cache.ttl_secs)),
            queue: RequestQueue::new(false, 4, 100, Duration::from_secs(60)),
            rate_limiter: RateLimiter::new(Duration::from_millis(0)),
            tool_ids: ToolIdCodec::default(),
            history: RequestHistory::new(),
            cost_history: Mutex::new(CostHistory::default()),
            notifier,
            accepted_keys: config.accepted_keys().to_vec(),
            state_dir: dir,
            pool,
            config,
        }
    }
}
