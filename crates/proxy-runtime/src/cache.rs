use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use proxy_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Fixed envelope of sampling/behavior options that feed the fingerprint,
/// read off the raw request JSON in a stable order (§4.5). Every key here is
/// optional on the wire; absence and `null` hash identically.
const ENVELOPE_KEYS: &[&str] = &[
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "seed",
    "stop",
    "response_format",
    "tool_choice",
    "user",
    "logit_bias",
    "logprobs",
    "n",
    "stream",
];

/// One cached response (C5). `response` is the raw JSON body that was
/// returned to the client; it is replayed verbatim on a hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: Value,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: i64,
    pub last_accessed: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saved_tokens: u64,
}

/// Deterministic fingerprint for a request (§4.5): a canonical JSON object
/// with a fixed key order — `model`, the message list reduced to
/// `{role, content-as-string}`, the fixed sampling/behavior envelope,
/// `tools` reserialized to a string, and the selected credential id — SHA-256
/// hashed and truncated to the first 16 hex characters, prefixed by the
/// model id so collisions across models are visually obvious in logs.
pub fn fingerprint(
    model: &str,
    messages: &[Message],
    options: &Value,
    tools: Option<&Value>,
    credential_id: &str,
) -> String {
    let mut envelope = serde_json::Map::new();
    envelope.insert("model".to_string(), Value::String(model.to_string()));

    let normalized_messages: Vec<Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": format!("{:?}", m.role).to_lowercase(),
                "content": m.content_as_string(),
            })
        })
        .collect();
    envelope.insert("messages".to_string(), Value::Array(normalized_messages));

    for key in ENVELOPE_KEYS {
        let value = options.get(*key).cloned().unwrap_or(Value::Null);
        envelope.insert((*key).to_string(), value);
    }

    let tools_str = tools.map(|t| t.to_string()).unwrap_or_default();
    envelope.insert("tools".to_string(), Value::String(tools_str));
    envelope.insert(
        "credential_id".to_string(),
        Value::String(credential_id.to_string()),
    );

    let canonical = serde_json::to_string(&Value::Object(envelope)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{model}:{}", &hex[..16])
}

/// Whether a response is eligible for caching at all (§4.5): tool-call
/// outputs belong to an in-progress agent turn and streaming responses are
/// never cached.
pub fn is_cacheable(has_tool_calls: bool, is_streaming: bool) -> bool {
    !has_tool_calls && !is_streaming
}

/// Deterministic fingerprint -> response LRU, TTL-bounded (C5).
pub struct RequestCache {
    entries: HashMap<String, CacheEntry>,
    max_size: usize,
    ttl_secs: i64,
    stats: CacheStats,
}

impl RequestCache {
    pub fn new(max_size: usize, ttl_secs: i64) -> Self {
        RequestCache {
            entries: HashMap::new(),
            max_size,
            ttl_secs,
            stats: CacheStats::default(),
        }
    }

    /// Returns the entry and bumps its recency/hit-count bookkeeping, or
    /// `None` on a miss. An entry older than the TTL is treated as absent
    /// and is evicted on the way out, matching "expired-by-TTL entries are
    /// deleted on access and reported as miss."
    pub fn get(&mut self, key: &str, now: i64) -> Option<CacheEntry> {
        let expired = self
            .entries
            .get(key)
            .map(|e| now - e.created_at > self.ttl_secs)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.stats.misses += 1;
            return None;
        }
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = now;
                entry.hit_count += 1;
                self.stats.hits += 1;
                self.stats.saved_tokens += entry.input_tokens + entry.output_tokens;
                Some(entry.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts an entry, then evicts by ascending `last_accessed` until the
    /// map is back at or below `max_size` (§4.5, invariant #5 in spec.md §8).
    pub fn set(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
        while self.entries.len() > self.max_size {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest_key);
            } else {
                break;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load(path: &PathBuf) -> Self {
        Self::load_with(path, 500, 300)
    }

    /// Loads persisted `{entries, stats}`, discarding any entry already past
    /// TTL at load time. Missing or corrupt files yield an empty cache,
    /// mirroring `CredentialStore::load`'s not-an-error stance.
    pub fn load_with(path: &PathBuf, max_size: usize, ttl_secs: i64) -> Self {
        let mut cache = RequestCache::new(max_size, ttl_secs);
        if let Ok(raw) = fs::read_to_string(path) {
            if let Ok(persisted) = serde_json::from_str::<PersistedCache>(&raw) {
                let now = proxy_core::now_unix();
                for (key, entry) in persisted.entries {
                    if now - entry.created_at <= ttl_secs {
                        cache.entries.insert(key, entry);
                    }
                }
                cache.stats = persisted.stats;
            }
        }
        cache
    }

    /// Best-effort write-back; failures are logged, never propagated (same
    /// policy as C1's store).
    pub fn persist(&self, path: &PathBuf) {
        let persisted = PersistedCache {
            entries: self.entries.clone(),
            stats: self.stats.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&persisted) {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = fs::write(path, json) {
                tracing::warn!(error = %e, path = %path.display(), "failed to persist request cache");
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCache {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::Message;

    fn entry(at: i64) -> CacheEntry {
        CacheEntry {
            fingerprint: "f".into(),
            response: Value::Null,
            model: "gpt-4.1".into(),
            input_tokens: 10,
            output_tokens: 5,
            created_at: at,
            last_accessed: at,
            hit_count: 0,
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_model_prefixed() {
        let messages = vec![Message::user("2+2")];
        let options = serde_json::json!({"temperature": 0.0});
        let a = fingerprint("gpt-4.1", &messages, &options, None, "acc-1");
        let b = fingerprint("gpt-4.1", &messages, &options, None, "acc-1");
        assert_eq!(a, b);
        assert!(a.starts_with("gpt-4.1:"));
        assert_eq!(a.len(), "gpt-4.1:".len() + 16);
    }

    #[test]
    fn fingerprint_changes_with_credential_id() {
        let messages = vec![Message::user("hi")];
        let options = serde_json::json!({});
        let a = fingerprint("gpt-4.1", &messages, &options, None, "acc-1");
        let b = fingerprint("gpt-4.1", &messages, &options, None, "acc-2");
        assert_ne!(a, b);
    }

    #[test]
    fn not_cacheable_with_tool_calls_or_streaming() {
        assert!(!is_cacheable(true, false));
        assert!(!is_cacheable(false, true));
        assert!(is_cacheable(false, false));
    }

    #[test]
    fn get_miss_then_hit_updates_stats_and_recency() {
        let mut cache = RequestCache::new(10, 300);
        cache.set("k1".into(), entry(0));
        assert!(cache.get("k2", 1).is_none());
        let hit = cache.get("k1", 5).unwrap();
        assert_eq!(hit.hit_count, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entry_is_evicted_on_access_and_counted_as_miss() {
        let mut cache = RequestCache::new(10, 10);
        cache.set("k1".into(), entry(0));
        assert!(cache.get("k1", 100).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_preserves_size_invariant() {
        let mut cache = RequestCache::new(2, 1000);
        cache.set("a".into(), entry(1));
        cache.set("b".into(), entry(2));
        cache.set("c".into(), entry(3));
        assert!(cache.len() <= 2);
    }

    #[test]
    fn eviction_removes_least_recently_accessed() {
        let mut cache = RequestCache::new(2, 1000);
        cache.set("a".into(), entry(1));
        cache.set("b".into(), entry(2));
        // touch "a" so "b" becomes the least-recently-accessed
        cache.get("a", 50);
        cache.set("c".into(), entry(3));
        assert!(cache.get("a", 51).is_some());
        assert!(cache.get("b", 51).is_none());
    }

    #[test]
    fn persist_then_load_round_trips_and_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request-cache.json");
        let mut cache = RequestCache::new(10, 100);
        cache.set("fresh".into(), entry(proxy_core::now_unix()));
        cache.set("stale".into(), entry(0));
        cache.persist(&path);

        let loaded = RequestCache::load_with(&path, 10, 100);
        assert!(loaded.entries.contains_key("fresh"));
        assert!(!loaded.entries.contains_key("stale"));
    }
}
