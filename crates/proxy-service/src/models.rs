use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// Static description of one model the proxy knows about: vendor/family used
/// by the fallback scoring rubric (§4.11), declared endpoint support used by
/// the responses-bridge routing decision (§4.8.4), and the context window
/// used by truncation budget resolution (§4.8.7). This is a small in-process
/// table rather than a live upstream call — model metadata is treated as
/// known ahead of time.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub supported_endpoints: Vec<String>,
    pub context_window_tokens: u32,
    pub is_preview: bool,
}

impl ModelInfo {
    pub fn supports_chat_completions(&self) -> bool {
        self.supported_endpoints.iter().any(|e| e == "/chat/completions")
    }

    pub fn requires_responses_bridge(&self) -> bool {
        self.supported_endpoints.iter().any(|e| e == "/responses")
            && !self.supported_endpoints.iter().any(|e| e == "/chat/completions")
    }
}

/// The proxy's in-process model registry. A handful of representative
/// entries stand in for the upstream's real catalog — enough to exercise
/// the responses-bridge routing decision and the fallback scoring rubric.
pub fn registry() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "gpt-5".to_string(),
            supported_endpoints: vec!["/chat/completions".to_string(), "/responses".to_string()],
            context_window_tokens: 272_000,
            is_preview: false,
        },
        ModelInfo {
            id: "gpt-5-mini".to_string(),
            supported_endpoints: vec!["/chat/completions".to_string(), "/responses".to_string()],
            context_window_tokens: 272_000,
            is_preview: false,
        },
        ModelInfo {
            id: "gpt-5-codex".to_string(),
            supported_endpoints: vec!["/responses".to_string()],
            context_window_tokens: 272_000,
            is_preview: true,
        },
        ModelInfo {
            id: "gpt-4.1".to_string(),
            supported_endpoints: vec!["/chat/completions".to_string()],
            context_window_tokens: 1_047_576,
            is_preview: false,
        },
        ModelInfo {
            id: "claude-opus-4".to_string(),
            supported_endpoints: vec!["/chat/completions".to_string(), "/v1/messages".to_string()],
            context_window_tokens: 200_000,
            is_preview: false,
        },
    ]
}

pub fn find(id: &str) -> Option<ModelInfo> {
    registry().into_iter().find(|m| m.id == id)
}

/// `GET /models`, `/v1/models` (§6): the static registry, shaped like an
/// OpenAI model-list response.
pub async fn list_models() -> Json<Value> {
    let data: Vec<Value> = registry()
        .into_iter()
        .map(|m| json!({"id": m.id, "object": "model", "owned_by": "proxy"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}
