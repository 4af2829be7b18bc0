use serde::{Deserialize, Serialize};

/// A single conversation turn in the internal, dialect-neutral representation.
///
/// Every wire dialect (OpenAI chat, Anthropic messages, upstream responses)
/// normalizes into this shape before translation logic touches it, and every
/// outbound serializer consumes it rather than any dialect-specific struct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: Content::Text(text.into()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: Content::Text(text.into()),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Flattens this message's content into a plain string, the way the cache
    /// fingerprint and the truncation token estimator need it. Image parts
    /// contribute nothing but their presence is not otherwise observable here.
    pub fn content_as_string(&self) -> String {
        match &self.content {
            Content::Text(s) => s.clone(),
            Content::Null => String::new(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.clone()),
                    Part::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
    Tool,
}

/// `Content = Text(string) | Null | Parts(list<Part>)` per the design notes:
/// dynamic-message-content polymorphism collapses into this sum type and
/// every translator consumes/produces only this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<Part>),
    Null,
}

impl Default for Content {
    fn default() -> Self {
        Content::Null
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A tool invocation emitted by an assistant turn. `arguments` is always the
/// canonical JSON-encoded string form, never a parsed value — every dialect
/// reserializes it at its own boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_as_string_joins_text_parts_and_skips_images() {
        let msg = Message {
            role: Role::User,
            content: Content::Parts(vec![
                Part::Text {
                    text: "hello ".into(),
                },
                Part::ImageUrl {
                    image_url: ImageUrl {
                        url: "https://example.com/x.png".into(),
                        detail: None,
                    },
                },
                Part::Text {
                    text: "world".into(),
                },
            ]),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(msg.content_as_string(), "hello world");
    }

    #[test]
    fn content_null_stringifies_empty() {
        let msg = Message {
            role: Role::Assistant,
            content: Content::Null,
            name: None,
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(msg.content_as_string(), "");
    }

    #[test]
    fn tool_call_type_defaults_to_function() {
        let json = r#"{"id":"call_1","function":{"name":"f","arguments":"{}"}}"#;
        let tc: ToolCall = serde_json::from_str(json).unwrap();
        assert_eq!(tc.call_type, "function");
    }
}
