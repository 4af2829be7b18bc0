use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use proxy_core::credential::ErrorKind;
use proxy_core::{now_unix, Content, CredentialRecord, Message, ProxyError, Role};
use proxy_dialect::{
    estimate_tokens, normalize_message, normalize_request, normalize_tool_arguments, prune_schema,
    relink_tool_results, resolve_token_budget, responses_bridge, sanitize_tools,
    strip_cache_control, truncate_messages, ToolIdCodec,
};
use proxy_runtime::{
    fingerprint, is_cacheable, remap_quota_exhaustion, select_chain_fallback,
    select_endpoint_fallback, CacheEntry, ModelDescriptor, RequestKind, UpstreamEvent,
};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::dispatch::{self, dispatch_stream, dispatch_with_retry, Endpoint};
use crate::errors::{self, ApiError};
use crate::history::{CostCalculator, HistoryEntry, RequestStatus, ZeroCostCalculator};
use crate::models;
use crate::state::AppState;
use crate::upstream_stream::UpstreamSseParser;

/// Which wire dialect a request arrived in (§3). Fixes how the payload is
/// parsed, how the internal message list is re-rendered for upstream, and
/// how the final response/stream is shaped back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Responses,
}

/// A request after dialect-specific parsing, sanitization, translation, and
/// truncation (§4.8) — the shape every later pipeline stage shares
/// regardless of which wire dialect it arrived through.
struct PreparedRequest {
    model: String,
    messages: Vec<Message>,
    tools: Option<Vec<Value>>,
    tool_choice: Option<Value>,
    stream: bool,
    options: Value,
}

/// Entry point for `/chat/completions`, `/v1/messages`, and `/responses` (§4.10).
pub async fn handle_completion(
    state: Arc<AppState>,
    dialect: Dialect,
    payload: Value,
) -> Result<Response, ApiError> {
    state.rate_limiter.acquire(true).await?;
    let slot = state.queue.enqueue(queue_priority(RequestKind::Chat)).await?;

    let mut prepared = prepare_request(&payload, dialect)?;
    decode_tool_ids(&mut prepared.messages, &state.tool_ids);
    relink_tool_results(&mut prepared.messages);

    let model_info = models::find(&prepared.model);
    let context_window = model_info.as_ref().map(|m| m.context_window_tokens).unwrap_or(128_000);
    let max_output_tokens = prepared.options.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32);
    let max_prompt_tokens = prepared.options.get("max_prompt_tokens").and_then(Value::as_u64).map(|v| v as u32);
    let budget = resolve_token_budget(max_prompt_tokens, context_window, max_output_tokens);
    prepared.messages = truncate_messages(&prepared.messages, budget);

    let requires_bridge = dialect == Dialect::Responses
        || model_info.as_ref().map(|m| m.requires_responses_bridge()).unwrap_or(false);

    let request_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = now_unix();

    let (credential, token) = state
        .pool
        .select_with_token(|cred| dispatch::exchange_session_token(cred, &state.config.upstream_base_url))
        .await?;

    let has_tool_calls = prepared.tools.is_some();
    let cacheable = is_cacheable(has_tool_calls, prepared.stream);
    let cache_key = cacheable.then(|| {
        fingerprint(&prepared.model, &prepared.messages, &prepared.options, prepared.tools.as_ref().map(|t| json!(t)).as_ref(), &credential.id)
    });

    if let Some(key) = &cache_key {
        if let Some(entry) = state.cache.lock().await.get(key, now_unix()) {
            state
                .history
                .record(HistoryEntry {
                    id: request_id.clone(),
                    model: prepared.model.clone(),
                    credential_id: Some(credential.id.clone()),
                    status: RequestStatus::Cached,
                    cost: 0.0,
                    input_tokens: entry.input_tokens,
                    output_tokens: entry.output_tokens,
                    created_at: created,
                })
                .await;
            return Ok(shape_cached_response(dialect, &entry, &state.tool_ids));
        }
    }

    let upstream_payload = build_upstream_payload(&prepared, requires_bridge);

    let result = if prepared.stream && !requires_bridge {
        let url = format!("{}/chat/completions", state.config.upstream_base_url);
        let upstream = dispatch_stream(&url, &token, &prepared.messages, &upstream_payload, Endpoint::ChatCompletion).await;
        match upstream {
            Ok(response) => {
                let input_tokens: u64 = prepared.messages.iter().map(|m| estimate_tokens(m) as u64).sum();
                let body = render_stream_response(
                    dialect,
                    state.clone(),
                    request_id.clone(),
                    created,
                    prepared.model.clone(),
                    credential.id.clone(),
                    input_tokens,
                    response,
                );
                slot.complete().await;
                return Ok(body);
            }
            Err(e) => Err(ApiError::from(e)),
        }
    } else {
        dispatch_non_streaming(&state, &mut prepared, requires_bridge, upstream_payload, &credential, &token).await
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            state
                .history
                .record(HistoryEntry {
                    id: request_id.clone(),
                    model: prepared.model.clone(),
                    credential_id: Some(credential.id.clone()),
                    status: RequestStatus::Error,
                    cost: 0.0,
                    input_tokens: 0,
                    output_tokens: 0,
                    created_at: created,
                })
                .await;
            slot.complete().await;
            return Err(e);
        }
    };

    let cost = ZeroCostCalculator.cost(&prepared.model, outcome.input_tokens, outcome.output_tokens);
    state
        .history
        .record(HistoryEntry {
            id: request_id.clone(),
            model: prepared.model.clone(),
            credential_id: Some(credential.id.clone()),
            status: RequestStatus::Success,
            cost,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            created_at: created,
        })
        .await;

    let response = shape_response(dialect, &request_id, created, &prepared.model, &outcome, &state.tool_ids);

    if let Some(key) = cache_key {
        let wire_body = response_wire_body(dialect, &request_id, created, &prepared.model, &outcome, &state.tool_ids);
        state.cache.lock().await.set(
            key.clone(),
            CacheEntry {
                fingerprint: key,
                response: wire_body,
                model: prepared.model.clone(),
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
                created_at: created,
                last_accessed: created,
                hit_count: 0,
            },
        );
    }

    slot.complete().await;
    Ok(response)
}

/// `/embeddings`, `/v1/embeddings` (§6): shares the credential pool, queue,
/// and rate limiter wiring with chat completions, but embeddings are
/// dialect-agnostic and passed through to upstream verbatim.
pub async fn handle_embeddings(state: Arc<AppState>, payload: Value) -> Result<Response, ApiError> {
    state.rate_limiter.acquire(true).await?;
    let slot = state.queue.enqueue(queue_priority(RequestKind::Embedding)).await?;

    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("missing required field: model".into()))?
        .to_string();

    let (credential, token) = state
        .pool
        .select_with_token(|cred| dispatch::exchange_session_token(cred, &state.config.upstream_base_url))
        .await?;

    let url = format!("{}/embeddings", state.config.upstream_base_url);
    let request_id = format!("embd-{}", Uuid::new_v4());
    let created = now_unix();

    let result = dispatch_with_retry(&url, &token, &[], &payload, Endpoint::Embeddings).await;
    slot.complete().await;

    match result {
        Ok((status, body, _headers)) if status < 400 => {
            state
                .history
                .record(HistoryEntry {
                    id: request_id,
                    model,
                    credential_id: Some(credential.id),
                    status: RequestStatus::Success,
                    cost: 0.0,
                    input_tokens: 0,
                    output_tokens: 0,
                    created_at: created,
                })
                .await;
            Ok(Json(body).into_response())
        }
        Ok((status, body, headers)) => {
            let (message, code) = errors::normalize_upstream_error_body(&body);
            let remapped = remap_quota_exhaustion(status, code.as_deref(), &message);
            report_status(&state, remapped).await;
            state
                .history
                .record(HistoryEntry {
                    id: request_id,
                    model,
                    credential_id: Some(credential.id),
                    status: RequestStatus::Error,
                    cost: 0.0,
                    input_tokens: 0,
                    output_tokens: 0,
                    created_at: created,
                })
                .await;
            Err(ApiError::with_upstream_headers(
                ProxyError::ProviderError(message),
                headers,
            ))
        }
        Err(e) => {
            state
                .history
                .record(HistoryEntry {
                    id: request_id,
                    model,
                    credential_id: Some(credential.id),
                    status: RequestStatus::Error,
                    cost: 0.0,
                    input_tokens: 0,
                    output_tokens: 0,
                    created_at: created,
                })
                .await;
            Err(e.into())
        }
    }
}

fn queue_priority(kind: RequestKind) -> i64 {
    match kind {
        RequestKind::Chat | RequestKind::Message => 0,
        RequestKind::Embedding => -1,
    }
}

fn prepare_request(payload: &Value, dialect: Dialect) -> Result<PreparedRequest, ProxyError> {
    let (model, mut messages, tools, tool_choice, stream, options) = match dialect {
        Dialect::OpenAi | Dialect::Responses => {
            let normalized = normalize_request(payload)?;
            let tools = normalized.options.get("tools").and_then(Value::as_array).cloned();
            let tool_choice = normalized.options.get("tool_choice").cloned();
            let stream = normalized.options.get("stream").and_then(Value::as_bool).unwrap_or(false);
            (normalized.model, normalized.messages, tools, tool_choice, stream, normalized.options)
        }
        Dialect::Anthropic => parse_anthropic_request(payload)?,
    };

    for message in messages.iter_mut() {
        strip_cache_control(message);
    }

    let tools = tools.map(sanitize_and_prune_tools);

    Ok(PreparedRequest { model, messages, tools, tool_choice, stream, options })
}

fn parse_anthropic_request(
    payload: &Value,
) -> Result<(String, Vec<Message>, Option<Vec<Value>>, Option<Value>, bool, Value), ProxyError> {
    use proxy_dialect::anthropic;

    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("missing required field: model".into()))?
        .to_string();

    let mut messages = Vec::new();
    if let Some(system) = payload.get("system") {
        if let Some(msg) = anthropic::system_field_to_message(system) {
            messages.push(msg);
        }
    }

    let raw_messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::InvalidRequest("messages must be an array".into()))?;
    for raw in raw_messages {
        let role = match raw.get("role").and_then(Value::as_str) {
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        };
        let content_value = raw.get("content").cloned().unwrap_or(Value::Null);
        messages.push(normalize_message(role, &content_value, None));
    }

    let tools = payload
        .get("tools")
        .and_then(Value::as_array)
        .map(|t| anthropic::anthropic_tools_to_internal(t));
    let tool_choice = payload.get("tool_choice").map(anthropic::anthropic_tool_choice_to_internal);
    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let mut options = payload.clone();
    if let Value::Object(map) = &mut options {
        for key in ["model", "messages", "system", "tools", "tool_choice", "stream"] {
            map.remove(key);
        }
    }

    Ok((model, messages, tools, tool_choice, stream, options))
}

/// Drops unsupported tool types and rewrites `apply_patch` (§4.8.6), then
/// strips non-portable JSON Schema keywords from every surviving tool's
/// parameter schema.
fn sanitize_and_prune_tools(tools: Vec<Value>) -> Vec<Value> {
    sanitize_tools(&tools)
        .into_iter()
        .map(|mut tool| {
            if let Some(params) = tool.get("function").and_then(|f| f.get("parameters")).cloned() {
                let pruned = prune_schema(&params);
                if let Some(function) = tool.get_mut("function") {
                    function["parameters"] = pruned;
                }
            }
            tool
        })
        .collect()
}

fn decode_tool_ids(messages: &mut [Message], codec: &ToolIdCodec) {
    for message in messages.iter_mut() {
        if let Some(calls) = &mut message.tool_calls {
            for call in calls.iter_mut() {
                call.id = codec.decode(&call.id);
            }
        }
        if let Some(id) = &message.tool_call_id {
            message.tool_call_id = Some(codec.decode(id));
        }
    }
}

fn encode_tool_ids(message: &mut Message, codec: &ToolIdCodec) {
    if let Some(calls) = &mut message.tool_calls {
        for call in calls.iter_mut() {
            call.id = codec.encode(&call.id);
        }
    }
}

fn encode_event_ids(event: UpstreamEvent, codec: &ToolIdCodec) -> UpstreamEvent {
    match event {
        UpstreamEvent::ToolUseStart { index, id, name } => {
            UpstreamEvent::ToolUseStart { index, id: codec.encode(&id), name }
        }
        UpstreamEvent::ToolUseComplete { index, mut tool_call } => {
            tool_call.id = codec.encode(&tool_call.id);
            UpstreamEvent::ToolUseComplete { index, tool_call }
        }
        other => other,
    }
}

fn build_upstream_payload(prepared: &PreparedRequest, bridged: bool) -> Value {
    if bridged {
        let bridged_request = responses_bridge::to_responses_input(&prepared.messages);
        let mut payload = json!({
            "model": prepared.model,
            "input": bridged_request.input,
            "stream": false,
        });
        if let Some(instructions) = bridged_request.instructions {
            payload["instructions"] = json!(instructions);
        }
        if let Some(tools) = &prepared.tools {
            payload["tools"] = json!(responses_bridge::to_responses_tools(tools));
        }
        if let Some(tool_choice) = &prepared.tool_choice {
            payload["tool_choice"] = tool_choice.clone();
        }
        return payload;
    }

    let mut payload = prepared.options.clone();
    if let Value::Object(map) = &mut payload {
        map.insert("model".to_string(), json!(prepared.model));
        map.insert(
            "messages".to_string(),
            Value::Array(prepared.messages.iter().map(|m| serde_json::to_value(m).unwrap_or(Value::Null)).collect()),
        );
        map.insert("stream".to_string(), json!(false));
        match &prepared.tools {
            Some(tools) => {
                map.insert("tools".to_string(), Value::Array(tools.clone()));
            }
            None => {
                map.remove("tools");
            }
        }
        match &prepared.tool_choice {
            Some(tc) => {
                map.insert("tool_choice".to_string(), tc.clone());
            }
            None => {
                map.remove("tool_choice");
            }
        }
    }
    payload
}

/// Outcome of a successful (possibly model-substituted) non-streaming
/// dispatch: the assistant message, its finish reason, token usage, and the
/// model id actually used (may differ from what the client requested, per
/// C11's fallback rubric).
struct DispatchOutcome {
    message: Message,
    finish_reason: &'static str,
    usage: Option<Value>,
    input_tokens: u64,
    output_tokens: u64,
    model_used: String,
}

/// Whether an upstream error describes the requested model not supporting
/// the endpoint just called (§4.11, "endpoint not supported for this
/// model"), as opposed to a capacity/rate-limit-class failure.
fn is_model_not_supported(status: u16, code: Option<&str>, message: &str) -> bool {
    if status != 400 {
        return false;
    }
    let lower = message.to_lowercase();
    matches!(code, Some("model_not_supported") | Some("unsupported_endpoint"))
        || lower.contains("does not support")
        || lower.contains("not supported for this model")
        || lower.contains("unsupported model")
}

/// Builds the registry view `select_endpoint_fallback` scores over, filtered
/// to models that support the endpoint the caller is actually bridged to.
fn endpoint_sibling(requested_id: &str, bridged: bool) -> Option<String> {
    let endpoint_path = if bridged { "/responses" } else { "/chat/completions" };
    let candidates: Vec<ModelDescriptor> = models::registry()
        .into_iter()
        .map(|m| ModelDescriptor {
            supports_endpoint: m.supported_endpoints.iter().any(|e| e == endpoint_path),
            is_preview: m.is_preview,
            id: m.id,
        })
        .collect();
    select_endpoint_fallback(requested_id, &candidates).map(|c| c.id.clone())
}

async fn dispatch_non_streaming(
    state: &AppState,
    prepared: &mut PreparedRequest,
    bridged: bool,
    mut upstream_payload: Value,
    initial_credential: &CredentialRecord,
    initial_token: &str,
) -> Result<DispatchOutcome, ApiError> {
    let path = if bridged { "responses" } else { "chat/completions" };
    let endpoint = if bridged { Endpoint::ChatCompletion } else { Endpoint::ChatCompletion };

    let mut credential = initial_credential.clone();
    let mut token = initial_token.to_string();
    let mut model = prepared.model.clone();
    let mut tried_model_fallback = false;
    let mut credential_attempts = 0u32;

    loop {
        let url = format!("{}/{}", state.config.upstream_base_url, path);
        match dispatch_with_retry(&url, &token, &prepared.messages, &upstream_payload, endpoint).await {
            Ok((status, body, _headers)) if status < 400 => {
                state.pool.set_current(&credential.id).await;
                let (message, finish_reason, usage, input_tokens, output_tokens) = if bridged {
                    parse_bridged_response(&body)
                } else {
                    parse_chat_completion_response(&body)
                };
                return Ok(DispatchOutcome { message, finish_reason, usage, input_tokens, output_tokens, model_used: model });
            }
            Ok((status, body, headers)) => {
                let (message, code) = errors::normalize_upstream_error_body(&body);
                let remapped = remap_quota_exhaustion(status, code.as_deref(), &message);
                report_status(state, remapped).await;

                if !tried_model_fallback && is_model_not_supported(status, code.as_deref(), &message) {
                    if let Some(fallback_id) = endpoint_sibling(&model, bridged) {
                        tried_model_fallback = true;
                        model = fallback_id;
                        if let Value::Object(map) = &mut upstream_payload {
                            map.insert("model".to_string(), json!(model));
                        }
                        continue;
                    }
                }

                if (remapped == 402 || status == 429)
                    && !tried_model_fallback
                    && state.config.model_fallback_enabled
                {
                    if let Some(fallback_id) = select_chain_fallback(&model, &state.config.fallback_chain, |_| true) {
                        tried_model_fallback = true;
                        model = fallback_id.to_string();
                        if let Value::Object(map) = &mut upstream_payload {
                            map.insert("model".to_string(), json!(model));
                        }
                        continue;
                    }
                }

                if matches!(remapped, 401 | 403 | 429) && credential_attempts < 1 {
                    credential_attempts += 1;
                    let (next_credential, next_token) = state
                        .pool
                        .select_with_token(|cred| dispatch::exchange_session_token(cred, &state.config.upstream_base_url))
                        .await
                        .map_err(ApiError::from)?;
                    credential = next_credential;
                    token = next_token;
                    continue;
                }

                return Err(ApiError::with_upstream_headers(
                    ProxyError::ProviderError(format!("upstream returned {status}: {message}")),
                    headers,
                ));
            }
            Err(ProxyError::RateLimited { message, retry_after_secs }) => {
                state.pool.report_error(ErrorKind::RateLimit, Some(now_unix() + retry_after_secs.unwrap_or(60) as i64)).await;
                if credential_attempts < 1 {
                    credential_attempts += 1;
                    let (next_credential, next_token) = state
                        .pool
                        .select_with_token(|cred| dispatch::exchange_session_token(cred, &state.config.upstream_base_url))
                        .await
                        .map_err(ApiError::from)?;
                    credential = next_credential;
                    token = next_token;
                    continue;
                }
                return Err(ApiError::from(ProxyError::RateLimited { message, retry_after_secs }));
            }
            Err(e) => return Err(ApiError::from(e)),
        }
    }
}

async fn report_status(state: &AppState, status: u16) {
    match status {
        402 => state.pool.report_error(ErrorKind::Quota, None).await,
        401 | 403 => state.pool.report_error(ErrorKind::Auth, None).await,
        429 => state.pool.report_error(ErrorKind::RateLimit, Some(now_unix() + 60)).await,
        _ => {}
    }
}

fn parse_chat_completion_response(body: &Value) -> (Message, &'static str, Option<Value>, u64, u64) {
    let choice = body.get("choices").and_then(|c| c.get(0)).cloned().unwrap_or(Value::Null);
    let message_value = choice.get("message").cloned().unwrap_or(Value::Null);
    let content_value = message_value.get("content").cloned().unwrap_or(Value::Null);
    let mut message = normalize_message(Role::Assistant, &content_value, None);

    if let Some(tool_calls) = message_value.get("tool_calls").and_then(Value::as_array) {
        let mut parsed = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls {
            let id = tc.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let function = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = function.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = normalize_tool_arguments(&function.get("arguments").cloned().unwrap_or(Value::Null));
            parsed.push(proxy_core::ToolCall {
                id,
                call_type: "function".into(),
                function: proxy_core::FunctionCall { name, arguments },
            });
        }
        message.tool_calls = Some(parsed);
    }

    let finish_reason: &'static str = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => "tool_calls",
        Some("length") => "length",
        Some("content_filter") => "content_filter",
        _ => "stop",
    };

    let usage = body.get("usage").cloned();
    let input_tokens = usage.as_ref().and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0);
    let output_tokens = usage.as_ref().and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0);

    (message, finish_reason, usage, input_tokens, output_tokens)
}

fn parse_bridged_response(body: &Value) -> (Message, &'static str, Option<Value>, u64, u64) {
    let items: Vec<responses_bridge::ResponsesOutputItem> = body
        .get("output")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_responses_output_item).collect())
        .unwrap_or_default();
    let (message, finish_reason) = responses_bridge::from_responses_output(&items);
    let usage = body.get("usage").cloned();
    let input_tokens = usage.as_ref().and_then(|u| u.get("input_tokens")).and_then(Value::as_u64).unwrap_or(0);
    let output_tokens = usage.as_ref().and_then(|u| u.get("output_tokens")).and_then(Value::as_u64).unwrap_or(0);
    (message, finish_reason, usage, input_tokens, output_tokens)
}

fn parse_responses_output_item(item: &Value) -> responses_bridge::ResponsesOutputItem {
    let text = item.get("content").and_then(Value::as_array).map(|blocks| {
        blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("")
    });
    responses_bridge::ResponsesOutputItem {
        item_type: item.get("type").and_then(Value::as_str).unwrap_or("").to_string(),
        call_id: item.get("call_id").and_then(Value::as_str).map(String::from),
        name: item.get("name").and_then(Value::as_str).map(String::from),
        arguments: item.get("arguments").and_then(Value::as_str).map(String::from),
        text: text.filter(|t| !t.is_empty()),
    }
}

fn shape_response(
    dialect: Dialect,
    request_id: &str,
    created: i64,
    model: &str,
    outcome: &DispatchOutcome,
    tool_ids: &ToolIdCodec,
) -> Response {
    Json(response_wire_body(dialect, request_id, created, model, outcome, tool_ids)).into_response()
}

fn response_wire_body(
    dialect: Dialect,
    request_id: &str,
    created: i64,
    model: &str,
    outcome: &DispatchOutcome,
    tool_ids: &ToolIdCodec,
) -> Value {
    let mut message = outcome.message.clone();
    encode_tool_ids(&mut message, tool_ids);

    match dialect {
        Dialect::Anthropic => {
            use proxy_dialect::anthropic;
            let content = anthropic::message_to_anthropic_content_blocks(&message);
            let stop_reason = anthropic::finish_reason_to_stop_reason(outcome.finish_reason);
            json!({
                "id": request_id,
                "type": "message",
                "role": "assistant",
                "model": outcome.model_used,
                "content": content,
                "stop_reason": stop_reason,
                "stop_sequence": null,
                "usage": {"input_tokens": outcome.input_tokens, "output_tokens": outcome.output_tokens}
            })
        }
        Dialect::Responses => {
            let output = message_to_responses_output(&message);
            json!({
                "id": request_id,
                "object": "response",
                "created_at": created,
                "model": outcome.model_used,
                "output": output,
                "usage": outcome.usage.clone().unwrap_or(json!({"input_tokens": outcome.input_tokens, "output_tokens": outcome.output_tokens}))
            })
        }
        Dialect::OpenAi => {
            let content_value = serde_json::to_value(&message.content).unwrap_or(Value::Null);
            let mut msg = json!({"role": "assistant", "content": content_value});
            if let Some(tool_calls) = &message.tool_calls {
                msg["tool_calls"] = serde_json::to_value(tool_calls).unwrap_or(Value::Null);
            }
            let mut body = json!({
                "id": request_id,
                "object": "chat.completion",
                "created": created,
                "model": outcome.model_used,
                "choices": [{"index": 0, "message": msg, "finish_reason": outcome.finish_reason}],
            });
            if let Some(usage) = &outcome.usage {
                body["usage"] = usage.clone();
            } else {
                body["usage"] = json!({
                    "prompt_tokens": outcome.input_tokens,
                    "completion_tokens": outcome.output_tokens,
                    "total_tokens": outcome.input_tokens + outcome.output_tokens
                });
            }
            let _ = model;
            body
        }
    }
}

fn message_to_responses_output(message: &Message) -> Vec<Value> {
    let mut output = Vec::new();
    let text = message.content_as_string();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text}]
        }));
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            output.push(json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments,
            }));
        }
    }
    output
}

fn shape_cached_response(dialect: Dialect, entry: &CacheEntry, tool_ids: &ToolIdCodec) -> Response {
    // Cached bodies are stored pre-shaped for the dialect that produced them;
    // a hit under a different dialect than it was written for can't happen
    // because the fingerprint already folds in the model id and the request
    // shape, so the stored wire body is replayed verbatim.
    let _ = (dialect, tool_ids);
    Json(entry.response.clone()).into_response()
}

fn frame_to_event(frame: proxy_runtime::SseFrame) -> Event {
    let mut event = Event::default().data(frame.data);
    if let Some(name) = frame.event {
        event = event.event(name);
    }
    event
}

/// Records the outcome of a completed or abandoned stream (§4.10, §7):
/// `Cancelled` when the client disconnected before the stream finished,
/// `Error` when upstream failed mid-stream, `Success` otherwise. Output
/// tokens are a best-effort chars/4 estimate over the text actually
/// streamed, since upstream's own usage block only arrives in the
/// non-streaming response shape.
async fn record_stream_outcome(
    state: &AppState,
    request_id: &str,
    model: &str,
    credential_id: &str,
    created: i64,
    input_tokens: u64,
    streamed_chars: usize,
    cancelled: bool,
    errored: bool,
) {
    let status = if cancelled {
        RequestStatus::Cancelled
    } else if errored {
        RequestStatus::Error
    } else {
        RequestStatus::Success
    };
    let output_tokens = if streamed_chars == 0 { 0 } else { (streamed_chars as u64 / 4).max(1) };
    state
        .history
        .record(HistoryEntry {
            id: request_id.to_string(),
            model: model.to_string(),
            credential_id: Some(credential_id.to_string()),
            status,
            cost: 0.0,
            input_tokens,
            output_tokens,
            created_at: created,
        })
        .await;
}

/// Renders a single live upstream stream into SSE (§4.9). The byte-to-frame
/// pipeline runs on a spawned task that writes into a channel rather than
/// inline in the returned stream, so a client disconnect (the SSE body's
/// receiver dropping, which closes the channel from the other end) and a
/// clean finish both funnel through the same "finally" step that records
/// history (§4.10) as cancelled, errored, or successful.
fn render_stream_response(
    dialect: Dialect,
    state: Arc<AppState>,
    stream_id: String,
    created: i64,
    model: String,
    credential_id: String,
    input_tokens: u64,
    upstream: reqwest::Response,
) -> Response {
    let mut byte_stream = Box::pin(upstream.bytes_stream());
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);

    match dialect {
        Dialect::Anthropic => {
            let start = proxy_runtime::render_anthropic_message_start(&stream_id, &model);

            tokio::spawn(async move {
                if tx.send(frame_to_event(start)).await.is_err() {
                    record_stream_outcome(&state, &stream_id, &model, &credential_id, created, input_tokens, 0, true, false).await;
                    return;
                }

                let mut parser = UpstreamSseParser::new();
                let mut render_state = proxy_runtime::AnthropicStreamState::default();
                let mut streamed_chars = 0usize;
                let mut done = false;
                let mut errored = false;
                let mut cancelled = false;

                while let Some(chunk) = byte_stream.next().await {
                    let parsed = match chunk {
                        Ok(bytes) => parser.feed(&bytes),
                        Err(e) => Err(ProxyError::HttpError(e.to_string())),
                    };
                    let frames = match parsed {
                        Ok(events) => {
                            let mut out = Vec::new();
                            for event in events {
                                if let UpstreamEvent::Text(text) = &event {
                                    streamed_chars += text.len();
                                }
                                if matches!(event, UpstreamEvent::Done { .. }) {
                                    done = true;
                                }
                                let event = encode_event_ids(event, &state.tool_ids);
                                out.extend(proxy_runtime::render_anthropic_chunk(event, &mut render_state));
                            }
                            out
                        }
                        Err(_) => {
                            errored = true;
                            vec![proxy_runtime::render_anthropic_ping()]
                        }
                    };

                    for frame in frames {
                        if tx.send(frame_to_event(frame)).await.is_err() {
                            cancelled = true;
                            break;
                        }
                    }
                    if cancelled || done {
                        break;
                    }
                }

                record_stream_outcome(
                    &state,
                    &stream_id,
                    &model,
                    &credential_id,
                    created,
                    input_tokens,
                    streamed_chars,
                    cancelled,
                    errored && !done,
                )
                .await;
            });

            let ping = proxy_runtime::render_anthropic_ping();
            let sse_stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
            Sse::new(sse_stream)
                .keep_alive(
                    KeepAlive::new()
                        .interval(Duration::from_secs(15))
                        .event(Event::default().event(ping.event.unwrap_or_default()).data(ping.data)),
                )
                .into_response()
        }
        Dialect::OpenAi | Dialect::Responses => {
            tokio::spawn(async move {
                let mut parser = UpstreamSseParser::new();
                let mut render_state = proxy_runtime::OpenAiStreamState::default();
                let mut streamed_chars = 0usize;
                let mut errored = false;
                let mut cancelled = false;

                while let Some(chunk) = byte_stream.next().await {
                    let frames = match chunk {
                        Ok(bytes) => match parser.feed(&bytes) {
                            Ok(events) => {
                                let mut out = Vec::new();
                                for event in events {
                                    if let UpstreamEvent::Text(text) = &event {
                                        streamed_chars += text.len();
                                    }
                                    let event = encode_event_ids(event, &state.tool_ids);
                                    out.extend(proxy_runtime::render_openai_chunk(&stream_id, created, &model, event, &mut render_state));
                                }
                                out
                            }
                            Err(e) => {
                                errored = true;
                                proxy_runtime::render_openai_error_terminator(&stream_id, created, &model, &e.to_string(), &render_state)
                            }
                        },
                        Err(e) => {
                            errored = true;
                            proxy_runtime::render_openai_error_terminator(&stream_id, created, &model, &e.to_string(), &render_state)
                        }
                    };

                    for frame in frames {
                        if tx.send(frame_to_event(frame)).await.is_err() {
                            cancelled = true;
                            break;
                        }
                    }
                    if cancelled || render_state.finished {
                        break;
                    }
                }

                record_stream_outcome(
                    &state,
                    &stream_id,
                    &model,
                    &credential_id,
                    created,
                    input_tokens,
                    streamed_chars,
                    cancelled,
                    errored && !render_state.finished,
                )
                .await;
            });

            let sse_stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
            Sse::new(sse_stream)
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
                .into_response()
        }
    }
}
