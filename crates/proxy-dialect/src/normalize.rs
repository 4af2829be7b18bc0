use proxy_core::{Message, ProxyError, Role};
use serde_json::Value;

use crate::content::normalize_message;

/// The canonical `{model, messages, ...options}` envelope every downstream
/// stage consumes. `options` retains whatever sampling/behavior fields the
/// client sent (temperature, max_tokens, ...) as a raw JSON object — they
/// pass through untouched except where a later stage specifically needs one.
pub struct NormalizedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub options: Value,
}

/// Request normalization (§4.8.1): accepts `messages`, or falls back to
/// `prompt` (string -> single user message) or `input` (string / array of
/// typed items / object). Rejects payloads missing `model`, or with
/// `messages` present but not an array.
pub fn normalize_request(payload: &Value) -> Result<NormalizedRequest, ProxyError> {
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("missing required field: model".into()))?
        .to_string();

    let messages = if let Some(raw_messages) = payload.get("messages") {
        let arr = raw_messages
            .as_array()
            .ok_or_else(|| ProxyError::InvalidRequest("messages must be an array".into()))?;
        arr.iter().map(parse_wire_message).collect::<Result<Vec<_>, _>>()?
    } else if let Some(prompt) = payload.get("prompt").and_then(Value::as_str) {
        vec![Message::user(prompt)]
    } else if let Some(input) = payload.get("input") {
        normalize_input_field(input)?
    } else {
        Vec::new()
    };

    let mut options = payload.clone();
    if let Value::Object(map) = &mut options {
        map.remove("model");
        map.remove("messages");
        map.remove("prompt");
        map.remove("input");
    }

    Ok(NormalizedRequest {
        model,
        messages,
        options,
    })
}

fn parse_wire_message(raw: &Value) -> Result<Message, ProxyError> {
    let role_str = raw
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("message missing role".into()))?;
    let role = parse_role(role_str)?;
    let name = raw.get("name").and_then(Value::as_str).map(|s| s.to_string());
    let content_value = raw.get("content").cloned().unwrap_or(Value::Null);
    let mut message = normalize_message(role, &content_value, name);

    if let Some(tool_call_id) = raw.get("tool_call_id").and_then(Value::as_str) {
        message.tool_call_id = Some(tool_call_id.to_string());
    }
    if let Some(tool_calls) = raw.get("tool_calls").and_then(Value::as_array) {
        let mut parsed = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls {
            parsed.push(parse_wire_tool_call(tc)?);
        }
        message.tool_calls = Some(parsed);
    }
    Ok(message)
}

fn parse_role(s: &str) -> Result<Role, ProxyError> {
    match s {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        "developer" => Ok(Role::Developer),
        "tool" => Ok(Role::Tool),
        other => Err(ProxyError::InvalidRequest(format!("unknown role: {other}"))),
    }
}

fn parse_wire_tool_call(raw: &Value) -> Result<proxy_core::ToolCall, ProxyError> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("tool_call missing id".into()))?
        .to_string();
    let function = raw
        .get("function")
        .ok_or_else(|| ProxyError::InvalidRequest("tool_call missing function".into()))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let arguments_raw = function.get("arguments").cloned().unwrap_or(Value::Null);
    let arguments = normalize_tool_arguments(&arguments_raw);
    Ok(proxy_core::ToolCall {
        id,
        call_type: "function".into(),
        function: proxy_core::FunctionCall { name, arguments },
    })
}

/// Tool-call argument normalization: must be a string. Non-string values are
/// serialized. A string that fails to parse as JSON gets one repair pass
/// (escaping bare backslashes not already part of a valid escape sequence)
/// before being re-checked; if still unparseable, it is passed through
/// unchanged rather than discarded — corrupting it would break agent loops
/// worse than forwarding invalid JSON.
pub fn normalize_tool_arguments(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if serde_json::from_str::<Value>(s).is_ok() {
                s.clone()
            } else {
                let repaired = repair_bare_backslashes(s);
                if serde_json::from_str::<Value>(&repaired).is_ok() {
                    repaired
                } else {
                    s.clone()
                }
            }
        }
        other => serde_json::to_string(other).unwrap_or_else(|_| "{}".into()),
    }
}

fn repair_bare_backslashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('"') | Some('\\') | Some('/') | Some('b') | Some('f') | Some('n')
                | Some('r') | Some('t') | Some('u') => {
                    out.push(c);
                }
                _ => out.push_str("\\\\"),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// `input` can be a string, an array of typed items, or an object. Each item
/// is mapped per the fixed type-tag table: `input_text` -> user text,
/// `output_text` -> assistant text, `message` -> delegated parsing.
fn normalize_input_field(input: &Value) -> Result<Vec<Message>, ProxyError> {
    match input {
        Value::String(s) => Ok(vec![Message::user(s.clone())]),
        Value::Array(items) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                messages.push(normalize_input_item(item)?);
            }
            Ok(messages)
        }
        Value::Object(_) => Ok(vec![normalize_input_item(input)?]),
        _ => Err(ProxyError::InvalidRequest("input must be string, array, or object".into())),
    }
}

fn normalize_input_item(item: &Value) -> Result<Message, ProxyError> {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or("message");
    match item_type {
        "input_text" => {
            let text = item.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(Message::user(text))
        }
        "output_text" => {
            let text = item.get("text").and_then(Value::as_str).unwrap_or("");
            let mut msg = Message::user(text);
            msg.role = Role::Assistant;
            Ok(msg)
        }
        // "message" and any unrecognized tag both delegate to full message parsing.
        _ => parse_wire_message(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_model_is_rejected() {
        let payload = json!({"messages": []});
        let err = normalize_request(&payload).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn messages_not_an_array_is_rejected() {
        let payload = json!({"model": "gpt-4.1", "messages": "oops"});
        let err = normalize_request(&payload).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn prompt_string_becomes_single_user_message() {
        let payload = json!({"model": "gpt-4.1", "prompt": "2+2"});
        let req = normalize_request(&payload).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content_as_string(), "2+2");
    }

    #[test]
    fn input_text_item_maps_to_user_text() {
        let payload = json!({"model": "gpt-4.1", "input": [{"type": "input_text", "text": "hi"}]});
        let req = normalize_request(&payload).unwrap();
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.messages[0].content_as_string(), "hi");
    }

    #[test]
    fn non_string_arguments_are_serialized() {
        let args = json!({"x": 1});
        assert_eq!(normalize_tool_arguments(&args), "{\"x\":1}");
    }

    #[test]
    fn valid_json_string_arguments_pass_through() {
        let args = json!("{\"x\":1}");
        assert_eq!(normalize_tool_arguments(&args), "{\"x\":1}");
    }

    #[test]
    fn bare_backslash_gets_repaired() {
        let args = Value::String(r#"{"path": "C:\Users\x"}"#.to_string());
        let repaired = normalize_tool_arguments(&args);
        assert!(serde_json::from_str::<Value>(&repaired).is_ok());
    }

    #[test]
    fn unrepairable_string_passes_through_unchanged() {
        let broken = Value::String("not json at all {{{".to_string());
        assert_eq!(normalize_tool_arguments(&broken), "not json at all {{{");
    }
}
