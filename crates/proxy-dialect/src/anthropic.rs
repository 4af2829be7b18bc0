use proxy_core::{Content, Message, Part, Role};
use serde_json::{json, Value};

/// Anthropic's `system` field is either a bare string or a list of text
/// blocks; both collapse to a single internal system-role message.
pub fn system_field_to_message(system: &Value) -> Option<Message> {
    match system {
        Value::String(s) if !s.is_empty() => Some(Message::system(s.clone())),
        Value::Array(blocks) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() {
                None
            } else {
                Some(Message::system(text))
            }
        }
        _ => None,
    }
}

/// `tool_choice` mapping, client (Anthropic) -> internal/OpenAI form:
/// `{type: any}` -> "required"; `{type: tool, name}` -> `{type: function,
/// function: {name}}`; `auto|none|required` pass through.
pub fn anthropic_tool_choice_to_internal(choice: &Value) -> Value {
    match choice.get("type").and_then(Value::as_str) {
        Some("any") => json!("required"),
        Some("tool") => {
            let name = choice.get("name").and_then(Value::as_str).unwrap_or("");
            json!({"type": "function", "function": {"name": name}})
        }
        Some("auto") => json!("auto"),
        Some("none") => json!("none"),
        _ => choice.clone(),
    }
}

/// Anthropic's flat tool-list shape (`{name, description, input_schema}`)
/// into the internal/OpenAI function-tool shape (`{type: function, function:
/// {name, description, parameters}}`), the same way `anthropic_tool_choice_to_internal`
/// bridges `tool_choice`.
pub fn anthropic_tools_to_internal(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.get("name").cloned().unwrap_or(Value::Null),
                    "description": t.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": t.get("input_schema").cloned().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                }
            })
        })
        .collect()
}

/// Reverse mapping: internal/OpenAI function tools back to Anthropic's flat
/// tool-list shape.
pub fn internal_tools_to_anthropic(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            let function = t.get("function").unwrap_or(t);
            json!({
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "description": function.get("description").cloned().unwrap_or(Value::Null),
                "input_schema": function.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
        })
        .collect()
}

/// Reverse mapping, internal/OpenAI -> Anthropic wire form.
pub fn internal_tool_choice_to_anthropic(choice: &Value) -> Value {
    match choice {
        Value::String(s) if s == "required" => json!({"type": "any"}),
        Value::String(s) if s == "auto" || s == "none" => json!({"type": s}),
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("function") => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            json!({"type": "tool", "name": name})
        }
        other => other.clone(),
    }
}

/// `stop_reason` mapping for the Anthropic response surface: `tool_use` when
/// finish_reason is `tool_calls`, `end_turn` on `stop`, `max_tokens` on
/// `length`.
pub fn finish_reason_to_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

/// Serializes an internal assistant message into Anthropic content blocks:
/// any text content becomes a `text` block, and each tool call becomes a
/// trailing `{type: tool_use, id, name, input}` block (the Anthropic tool id
/// preserved verbatim, per the invariant in §4.8.5).
pub fn message_to_anthropic_content_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    match &message.content {
        Content::Text(text) if !text.is_empty() => {
            blocks.push(json!({"type": "text", "text": text}));
        }
        Content::Parts(parts) => {
            for part in parts {
                if let Part::Text { text } = part {
                    blocks.push(json!({"type": "text", "text": text}));
                }
            }
        }
        _ => {}
    }
    if let Some(tool_calls) = &message.tool_calls {
        for tc in tool_calls {
            let input: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Object(Default::default()));
            blocks.push(json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.function.name,
                "input": input,
            }));
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_string_becomes_system_message() {
        let msg = system_field_to_message(&json!("be terse")).unwrap();
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content_as_string(), "be terse");
    }

    #[test]
    fn system_block_list_joins_text() {
        let system = json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        let msg = system_field_to_message(&system).unwrap();
        assert_eq!(msg.content_as_string(), "a\nb");
    }

    #[test]
    fn tool_choice_any_maps_to_required() {
        let choice = json!({"type": "any"});
        assert_eq!(anthropic_tool_choice_to_internal(&choice), json!("required"));
    }

    #[test]
    fn tool_choice_named_tool_maps_to_function() {
        let choice = json!({"type": "tool", "name": "get_weather"});
        let internal = anthropic_tool_choice_to_internal(&choice);
        assert_eq!(internal, json!({"type": "function", "function": {"name": "get_weather"}}));
    }

    #[test]
    fn tool_choice_round_trips_through_both_directions() {
        let anthropic_choice = json!({"type": "tool", "name": "f"});
        let internal = anthropic_tool_choice_to_internal(&anthropic_choice);
        let back = internal_tool_choice_to_anthropic(&internal);
        assert_eq!(back, anthropic_choice);
    }

    #[test]
    fn anthropic_tool_list_converts_to_function_tools() {
        let tools = json!([{"name": "get_weather", "description": "look up weather", "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}}]);
        let internal = anthropic_tools_to_internal(tools.as_array().unwrap());
        assert_eq!(internal[0]["type"], "function");
        assert_eq!(internal[0]["function"]["name"], "get_weather");
        assert_eq!(internal[0]["function"]["parameters"]["properties"]["city"]["type"], "string");
    }

    #[test]
    fn tool_list_round_trips_through_both_directions() {
        let anthropic_tools = json!([{"name": "f", "description": "d", "input_schema": {"type": "object", "properties": {}}}]);
        let internal = anthropic_tools_to_internal(anthropic_tools.as_array().unwrap());
        let back = internal_tools_to_anthropic(&internal);
        assert_eq!(back, anthropic_tools.as_array().unwrap().clone());
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(finish_reason_to_stop_reason("tool_calls"), "tool_use");
        assert_eq!(finish_reason_to_stop_reason("length"), "max_tokens");
        assert_eq!(finish_reason_to_stop_reason("stop"), "end_turn");
    }

    #[test]
    fn tool_call_serializes_to_tool_use_block_with_preserved_id() {
        let message = Message {
            role: Role::Assistant,
            content: Content::Text("".into()),
            name: None,
            tool_call_id: None,
            tool_calls: Some(vec![proxy_core::ToolCall {
                id: "toolu_01abc".into(),
                call_type: "function".into(),
                function: proxy_core::FunctionCall {
                    name: "get_weather".into(),
                    arguments: "{\"city\":\"NYC\"}".into(),
                },
            }]),
        };
        let blocks = message_to_anthropic_content_blocks(&message);
        let tool_use = blocks.iter().find(|b| b["type"] == "tool_use").unwrap();
        assert_eq!(tool_use["id"], "toolu_01abc");
        assert_eq!(tool_use["input"]["city"], "NYC");
    }
}
