use proxy_core::{Content, FunctionCall, Message, Role, ToolCall};
use serde::Serialize;
use serde_json::Value;

/// One item of the responses-dialect input list, mirroring the upstream's
/// native "responses" wire shape: messages, function calls the assistant
/// issued, and function-call outputs the client is replaying back.
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesInputItem {
    Message {
        role: String,
        content: Vec<ResponsesContentItem>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesContentItem {
    InputText { text: String },
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ResponsesTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
    pub strict: Option<bool>,
}

pub struct BridgedRequest {
    pub instructions: Option<String>,
    pub input: Vec<ResponsesInputItem>,
}

/// Converts the canonical message list into the responses-dialect input list
/// (§4.8.4): system/developer messages become top-level `instructions`; user
/// messages become `message` items; assistant `tool_calls` become
/// `function_call` items; tool-role messages become `function_call_output`
/// items.
pub fn to_responses_input(messages: &[Message]) -> BridgedRequest {
    let mut instructions: Vec<String> = Vec::new();
    let mut input = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System | Role::Developer => {
                instructions.push(msg.content_as_string());
            }
            Role::User | Role::Assistant => {
                if let Some(tool_calls) = &msg.tool_calls {
                    for tc in tool_calls {
                        input.push(ResponsesInputItem::FunctionCall {
                            call_id: tc.id.clone(),
                            name: tc.function.name.clone(),
                            arguments: tc.function.arguments.clone(),
                        });
                    }
                    // an assistant message can carry both tool_calls and text;
                    // only emit a message item when there's real text content.
                    if !matches!(msg.content, Content::Null) && !msg.content_as_string().is_empty() {
                        input.push(message_item(msg));
                    }
                } else {
                    input.push(message_item(msg));
                }
            }
            Role::Tool => {
                input.push(ResponsesInputItem::FunctionCallOutput {
                    call_id: msg.tool_call_id.clone().unwrap_or_default(),
                    output: msg.content_as_string(),
                });
            }
        }
    }

    BridgedRequest {
        instructions: if instructions.is_empty() {
            None
        } else {
            Some(instructions.join("\n\n"))
        },
        input,
    }
}

fn message_item(msg: &Message) -> ResponsesInputItem {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        _ => "user",
    };
    ResponsesInputItem::Message {
        role: role.to_string(),
        content: vec![ResponsesContentItem::InputText {
            text: msg.content_as_string(),
        }],
    }
}

/// Converts internal tools (JSON Schema function specs) into the responses
/// dialect's flat tool shape.
pub fn to_responses_tools(tools: &[Value]) -> Vec<ResponsesTool> {
    tools
        .iter()
        .filter_map(|t| {
            let f = t.get("function").unwrap_or(t);
            Some(ResponsesTool {
                tool_type: "function".to_string(),
                name: f.get("name")?.as_str()?.to_string(),
                description: f.get("description").and_then(Value::as_str).map(String::from),
                parameters: f.get("parameters").cloned().unwrap_or(Value::Object(Default::default())),
                strict: None,
            })
        })
        .collect()
}

/// One output item from a responses-dialect response.
#[derive(Debug, Clone)]
pub struct ResponsesOutputItem {
    pub item_type: String,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
    pub text: Option<String>,
}

/// Converts responses-dialect `output` items back into choices-and-message
/// form: `function_call` items become `tool_calls`, and finish reason is
/// `tool_calls` when any exist, else `stop`.
pub fn from_responses_output(output: &[ResponsesOutputItem]) -> (Message, &'static str) {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for item in output {
        match item.item_type.as_str() {
            "message" => {
                if let Some(text) = &item.text {
                    text_parts.push(text.clone());
                }
            }
            "function_call" => {
                tool_calls.push(ToolCall {
                    id: item.call_id.clone().unwrap_or_default(),
                    call_type: "function".into(),
                    function: FunctionCall {
                        name: item.name.clone().unwrap_or_default(),
                        arguments: item.arguments.clone().unwrap_or_else(|| "{}".into()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
    let message = Message {
        role: Role::Assistant,
        content: if text_parts.is_empty() {
            Content::Null
        } else {
            Content::Text(text_parts.join(""))
        },
        name: None,
        tool_call_id: None,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
    };
    (message, finish_reason)
}
