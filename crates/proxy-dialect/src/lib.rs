pub mod anthropic;
pub mod content;
pub mod normalize;
pub mod responses_bridge;
pub mod sanitize;
pub mod tool_id;
pub mod truncate;

pub use content::{normalize_block, normalize_content_value, normalize_message, BlockOutcome, NormalizedContent};
pub use normalize::{normalize_request, normalize_tool_arguments, NormalizedRequest};
pub use responses_bridge::{
    from_responses_output, to_responses_input, to_responses_tools, BridgedRequest, ResponsesContentItem,
    ResponsesInputItem, ResponsesOutputItem, ResponsesTool,
};
pub use sanitize::{prune_schema, sanitize_tools, strip_cache_control};
pub use tool_id::{relink_tool_results, ToolIdCodec, TOOL_ID_MAP_CAPACITY, TOOL_ID_MAP_PRUNE_BATCH};
pub use truncate::{estimate_tokens, resolve_token_budget, truncate_messages};
