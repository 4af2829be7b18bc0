use proxy_core::{Content, FunctionCall, ImageUrl, Message, Part, Role, ToolCall};
use serde_json::Value;

/// Converts one dialect-native content block (already parsed as JSON) into
/// zero or one canonical `Part`s, or signals that the block should instead
/// become a distinct internal message (tool_use / tool_result blocks don't
/// map to a `Part` at all — they lift the whole enclosing message).
///
/// Mirrors the table in §4.8.3; `anything else` falls through to a text part
/// carrying the block's own JSON serialization.
pub enum BlockOutcome {
    Part(Part),
    /// A `tool_use` block found in an assistant turn: extracted into the
    /// message's `tool_calls` rather than its content.
    ToolUse(ToolCall),
    /// A `tool_result` block found in a user turn: the enclosing message
    /// becomes an internal tool-role message instead.
    ToolResult { tool_call_id: String, content: String },
    /// Nothing to emit (e.g. an empty/unsupported block that contributes
    /// nothing observable).
    Skip,
}

pub fn normalize_block(block: &Value) -> BlockOutcome {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");

    match block_type {
        "text" | "input_text" | "output_text" => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or("");
            BlockOutcome::Part(Part::Text { text: text.to_string() })
        }
        "thinking" => {
            let text = block.get("thinking").and_then(Value::as_str).unwrap_or("");
            BlockOutcome::Part(Part::Text { text: text.to_string() })
        }
        "image_url" => {
            let obj = block.get("image_url").cloned().unwrap_or(Value::Null);
            let url = obj.get("url").and_then(Value::as_str).unwrap_or("").to_string();
            let detail = obj
                .get("detail")
                .and_then(Value::as_str)
                .filter(|d| matches!(*d, "low" | "high" | "auto"))
                .map(|s| s.to_string());
            BlockOutcome::Part(Part::ImageUrl {
                image_url: ImageUrl { url, detail },
            })
        }
        "input_image" => {
            if let Some(obj) = block.get("image_url") {
                let url = obj.get("url").and_then(Value::as_str).unwrap_or("").to_string();
                return BlockOutcome::Part(Part::ImageUrl {
                    image_url: ImageUrl { url, detail: None },
                });
            }
            if let Some(source) = block.get("source") {
                let media = source
                    .get("media_type")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                let data = source.get("data").and_then(Value::as_str).unwrap_or("");
                return BlockOutcome::Part(Part::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{media};base64,{data}"),
                        detail: None,
                    },
                });
            }
            BlockOutcome::Skip
        }
        "image" => {
            if let Some(source) = block.get("source") {
                if source.get("type").and_then(Value::as_str) == Some("base64") {
                    let media = source
                        .get("media_type")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png");
                    let data = source.get("data").and_then(Value::as_str).unwrap_or("");
                    return BlockOutcome::Part(Part::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{media};base64,{data}"),
                            detail: None,
                        },
                    });
                }
            }
            BlockOutcome::Skip
        }
        "tool_result" => {
            let tool_call_id = block
                .get("tool_use_id")
                .or_else(|| block.get("tool_call_id"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let content = stringify_tool_result_content(block.get("content"));
            BlockOutcome::ToolResult { tool_call_id, content }
        }
        "tool_use" => {
            let id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let input = block.get("input").cloned().unwrap_or(Value::Object(Default::default()));
            BlockOutcome::ToolUse(ToolCall {
                id,
                call_type: "function".into(),
                function: FunctionCall {
                    name,
                    arguments: serde_json::to_string(&input).unwrap_or_else(|_| "{}".into()),
                },
            })
        }
        _ => BlockOutcome::Part(Part::Text {
            text: serde_json::to_string(block).unwrap_or_default(),
        }),
    }
}

fn stringify_tool_result_content(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
    }
}

/// Normalizes a whole content value (string, null, or array of blocks) into
/// canonical `Content`, plus any tool_use calls and tool_result conversions
/// extracted along the way (since those re-shape the enclosing message,
/// not just its content).
pub struct NormalizedContent {
    pub content: Content,
    pub tool_calls: Vec<ToolCall>,
    pub tool_result: Option<(String, String)>,
}

pub fn normalize_content_value(value: &Value) -> NormalizedContent {
    match value {
        Value::Null => NormalizedContent {
            content: Content::Null,
            tool_calls: Vec::new(),
            tool_result: None,
        },
        Value::String(s) => NormalizedContent {
            content: Content::Text(s.clone()),
            tool_calls: Vec::new(),
            tool_result: None,
        },
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            let mut tool_calls = Vec::new();
            let mut tool_result = None;
            for block in blocks {
                match normalize_block(block) {
                    BlockOutcome::Part(p) => parts.push(p),
                    BlockOutcome::ToolUse(tc) => tool_calls.push(tc),
                    BlockOutcome::ToolResult { tool_call_id, content } => {
                        tool_result = Some((tool_call_id, content));
                    }
                    BlockOutcome::Skip => {}
                }
            }
            let content = if parts.is_empty() {
                Content::Null
            } else {
                Content::Parts(parts)
            };
            NormalizedContent {
                content,
                tool_calls,
                tool_result,
            }
        }
        other => NormalizedContent {
            content: Content::Text(other.to_string()),
            tool_calls: Vec::new(),
            tool_result: None,
        },
    }
}

/// Applies `normalize_content_value` to a single already-role-tagged message,
/// folding extracted tool_use/tool_result blocks into the message's own
/// fields the way §4.8.3 describes ("convert message into an internal
/// tool-role message" / "extract as internal assistant tool_calls").
pub fn normalize_message(role: Role, content_value: &Value, name: Option<String>) -> Message {
    let normalized = normalize_content_value(content_value);
    if let Some((tool_call_id, text)) = normalized.tool_result {
        return Message {
            role: Role::Tool,
            content: Content::Text(text),
            name,
            tool_call_id: Some(tool_call_id),
            tool_calls: None,
        };
    }
    Message {
        role,
        content: normalized.content,
        name,
        tool_call_id: None,
        tool_calls: if normalized.tool_calls.is_empty() {
            None
        } else {
            Some(normalized.tool_calls)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_and_input_text_map_to_text_part() {
        let block = json!({"type": "input_text", "text": "hi"});
        match normalize_block(&block) {
            BlockOutcome::Part(Part::Text { text }) => assert_eq!(text, "hi"),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn thinking_block_becomes_text() {
        let block = json!({"type": "thinking", "thinking": "pondering"});
        match normalize_block(&block) {
            BlockOutcome::Part(Part::Text { text }) => assert_eq!(text, "pondering"),
            _ => panic!("expected text part"),
        }
    }

    #[test]
    fn image_base64_source_becomes_data_url() {
        let block = json!({
            "type": "image",
            "source": {"type": "base64", "media_type": "image/png", "data": "QUJD"}
        });
        match normalize_block(&block) {
            BlockOutcome::Part(Part::ImageUrl { image_url }) => {
                assert_eq!(image_url.url, "data:image/png;base64,QUJD");
            }
            _ => panic!("expected image part"),
        }
    }

    #[test]
    fn tool_result_block_lifts_to_tool_message() {
        let value = json!([{"type": "tool_result", "tool_use_id": "abc", "content": "42"}]);
        let msg = normalize_message(Role::User, &value, None);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("abc"));
        assert_eq!(msg.content_as_string(), "42");
    }

    #[test]
    fn tool_use_block_becomes_assistant_tool_call() {
        let value = json!([{"type": "tool_use", "id": "call_1", "name": "f", "input": {"x": 1}}]);
        let msg = normalize_message(Role::Assistant, &value, None);
        let calls = msg.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "f");
    }

    #[test]
    fn unknown_block_type_passes_through_as_serialized_text() {
        let block = json!({"type": "mystery", "foo": "bar"});
        match normalize_block(&block) {
            BlockOutcome::Part(Part::Text { text }) => {
                assert!(text.contains("mystery"));
            }
            _ => panic!("expected text fallback"),
        }
    }

    #[test]
    fn null_content_normalizes_to_null() {
        let normalized = normalize_content_value(&Value::Null);
        assert_eq!(normalized.content, Content::Null);
    }
}
