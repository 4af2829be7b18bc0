pub mod cache;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod stream;

pub use cache::{fingerprint, is_cacheable, CacheEntry, CacheStats, RequestCache};
pub use queue::{QueueMetrics, QueueSlot, RequestKind, RequestQueue};
pub use rate_limit::RateLimiter;
pub use retry::{
    is_retryable_network_error, is_retryable_status, normalize_model_id, parse_retry_after,
    remap_quota_exhaustion, score_sibling, select_chain_fallback, select_endpoint_fallback,
    ModelDescriptor, RetryPolicy,
};
pub use stream::{
    render_anthropic_chunk, render_anthropic_message_start, render_anthropic_ping,
    render_openai_chunk, render_openai_error_terminator, render_openai_ping,
    synthesize_openai_stream, AnthropicStreamState, OpenAiStreamState, SseFrame, UpstreamEvent,
};
