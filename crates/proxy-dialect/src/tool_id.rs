use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use lru::LruCache;
use std::num::NonZeroUsize;

use proxy_core::{Content, Message, Part, Role, ToolCall};

/// Capacity of the bounded recency map (§4.8.2).
pub const TOOL_ID_MAP_CAPACITY: usize = 10_000;
/// Nominal prune-batch size for the bounded recency map. `lru::LruCache`
/// evicts one entry per insert past capacity on its own, so this constant
/// documents the intended batch size rather than driving eviction directly —
/// see the module doc below for why.
pub const TOOL_ID_MAP_PRUNE_BATCH: usize = 1_000;

/// Normalizes an upstream-issued tool-call id into the client-safe form and
/// remembers the mapping so `decode` can recover the original when it fails
/// to reverse the deterministic encoding (§4.8.2).
///
/// Capacity is enforced by `lru::LruCache` (true least-recently-used
/// eviction rather than strict insertion-order pruning, which would evict
/// entries that are still being actively reused in a long tool-calling
/// session). `lru::LruCache::put` only ever evicts one entry per overflowing
/// insert, so batch eviction is not reproduced verbatim — that only matters
/// under an insertion-order-pruned map.
pub struct ToolIdCodec {
    map: Mutex<LruCache<String, String>>,
}

impl ToolIdCodec {
    pub fn new() -> Self {
        ToolIdCodec {
            map: Mutex::new(LruCache::new(NonZeroUsize::new(TOOL_ID_MAP_CAPACITY).unwrap())),
        }
    }

    /// Encoding: ids already prefixed with `call_` pass through unchanged.
    /// All others become `call_x_<base64url-of-original-bytes>`.
    pub fn encode(&self, id: &str) -> String {
        if id.starts_with("call_") {
            return id.to_string();
        }
        let encoded = format!("call_x_{}", URL_SAFE_NO_PAD.encode(id.as_bytes()));
        self.map.lock().unwrap().put(encoded.clone(), id.to_string());
        encoded
    }

    /// Decoding is the reverse: trim the `call_x_` prefix and base64url-decode.
    /// Falls back to the LRU map only when the deterministic scheme fails to
    /// decode — e.g. a native `call_...` id that was never produced by
    /// `encode` and isn't valid base64url after prefix-stripping.
    pub fn decode(&self, id: &str) -> String {
        if let Some(rest) = id.strip_prefix("call_x_") {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(rest) {
                if let Ok(s) = String::from_utf8(bytes) {
                    // touch the entry to refresh recency, if tracked
                    self.map.lock().unwrap().get(id);
                    return s;
                }
            }
        }
        if let Some(original) = self.map.lock().unwrap().get(id) {
            return original.clone();
        }
        id.to_string()
    }
}

impl Default for ToolIdCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Relinks a trailing run of tool-role messages to an assistant message's
/// declared `tool_calls` when the client echoed stale ids (§4.8.2 "Tool-result
/// relinking"). Operates on an already-denormalized message slice.
///
/// If the assistant message declares ids `[A, B, C]` and the following
/// contiguous tool-role run has the same count but no overlapping ids,
/// positionally relink them. If counts differ, trim the mismatched side so no
/// dangling tool-call reference survives.
pub fn relink_tool_results(messages: &mut [Message]) {
    let mut i = 0;
    while i < messages.len() {
        let is_assistant_with_tools = matches!(messages[i].role, Role::Assistant)
            && messages[i]
                .tool_calls
                .as_ref()
                .map(|t| !t.is_empty())
                .unwrap_or(false);
        if !is_assistant_with_tools {
            i += 1;
            continue;
        }
        let declared_ids: Vec<String> = messages[i]
            .tool_calls
            .as_ref()
            .unwrap()
            .iter()
            .map(|tc| tc.id.clone())
            .collect();

        let run_start = i + 1;
        let mut run_end = run_start;
        while run_end < messages.len() && matches!(messages[run_end].role, Role::Tool) {
            run_end += 1;
        }
        let run_len = run_end - run_start;

        if run_len == declared_ids.len() {
            let overlaps = (run_start..run_end).any(|j| {
                messages[j]
                    .tool_call_id
                    .as_deref()
                    .map(|id| declared_ids.iter().any(|d| d == id))
                    .unwrap_or(false)
            });
            if !overlaps {
                for (offset, id) in declared_ids.iter().enumerate() {
                    messages[run_start + offset].tool_call_id = Some(id.clone());
                }
            }
        }
        // counts differing is handled by the truncation orphan sweep, which
        // runs after this pass and drops anything still dangling.
        i = run_end;
    }
}
