use std::collections::HashMap;

use proxy_core::{FunctionCall, ToolCall};
use serde_json::{json, Value};

/// One unit of upstream streaming progress, dialect-independent (C9). This is
/// the seam between whatever wire format upstream speaks and the client's
/// chosen dialect; the forwarder only ever sees these.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Text(String),
    ToolUseStart { index: usize, id: String, name: String },
    ToolUseInputDelta { index: usize, partial_json: String },
    ToolUseComplete { index: usize, tool_call: ToolCall },
    Done { stop_reason: String },
}

/// A single SSE wire frame: an optional named `event:` line and the `data:`
/// payload. Named events are only used by the Anthropic dialect; OpenAI
/// streaming frames carry no `event:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    fn data(data: String) -> Self {
        SseFrame { event: None, data }
    }

    fn named(event: &str, data: String) -> Self {
        SseFrame {
            event: Some(event.to_string()),
            data,
        }
    }

    /// OpenAI's termination sentinel.
    pub fn done() -> Self {
        SseFrame::data("[DONE]".to_string())
    }
}

#[derive(Default)]
struct ToolUseState {
    id: String,
    name: String,
    arguments_buffer: String,
}

/// Per-stream accumulator shared across calls to `render_openai_chunk`. Tracks
/// whether the terminal frame has already been emitted and whether any
/// tool-call deltas were seen, both needed to shape mid-stream error
/// terminators correctly.
#[derive(Default)]
pub struct OpenAiStreamState {
    tool_states: HashMap<usize, ToolUseState>,
    saw_tool_calls: bool,
    pub finished: bool,
    stop_reason: Option<String>,
}

/// Renders one upstream event into zero or more OpenAI chat-completion-chunk
/// SSE frames (§4.9). Caller appends `[DONE]` once `state.finished` flips.
pub fn render_openai_chunk(
    stream_id: &str,
    created: i64,
    model: &str,
    event: UpstreamEvent,
    state: &mut OpenAiStreamState,
) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    match event {
        UpstreamEvent::Text(text) => {
            if text.is_empty() {
                return frames;
            }
            frames.push(SseFrame::data(
                json!({
                    "id": stream_id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseStart { index, id, name } => {
            state.saw_tool_calls = true;
            let entry = state.tool_states.entry(index).or_default();
            entry.id = id.clone();
            entry.name = name.clone();
            frames.push(SseFrame::data(
                json!({
                    "id": stream_id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": {"tool_calls": [{"index": index, "id": id, "type": "function", "function": {"name": name}}]},
                        "finish_reason": null
                    }]
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseInputDelta { index, partial_json } => {
            let entry = state.tool_states.entry(index).or_default();
            entry.arguments_buffer.push_str(&partial_json);
            let id_value = if entry.id.is_empty() {
                Value::Null
            } else {
                json!(entry.id)
            };
            frames.push(SseFrame::data(
                json!({
                    "id": stream_id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "delta": {"tool_calls": [{"index": index, "id": id_value, "type": "function", "function": {"arguments": partial_json}}]},
                        "finish_reason": null
                    }]
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseComplete { index, tool_call } => {
            let entry = state.tool_states.entry(index).or_default();
            entry.id = tool_call.id;
            entry.name = tool_call.function.name;
            entry.arguments_buffer = tool_call.function.arguments;
        }
        UpstreamEvent::Done { stop_reason } => {
            state.stop_reason = Some(stop_reason);
            let finish_reason = if state.saw_tool_calls {
                "tool_calls"
            } else {
                match state.stop_reason.as_deref() {
                    Some("length") => "length",
                    Some("content_filter") => "content_filter",
                    _ => "stop",
                }
            };
            frames.push(SseFrame::data(
                json!({
                    "id": stream_id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]
                })
                .to_string(),
            ));
            state.finished = true;
        }
    }
    frames
}

/// A keep-alive ping before any real data has arrived is an SSE comment
/// frame; once content has started flowing, translate pings into an
/// empty-delta chunk carrying the live response id/model so clients that
/// only understand chat-completion-chunk framing stay on the same id.
pub fn render_openai_ping(stream_id: &str, created: i64, model: &str, seen_data: bool) -> SseFrame {
    if !seen_data {
        return SseFrame::data(String::new());
    }
    SseFrame::data(
        json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": null}]
        })
        .to_string(),
    )
}

/// Mid-stream upstream failure after some frames were already emitted
/// (§4.9). Never reports `finish_reason: tool_calls`, and omits any content
/// delta once tool-call deltas have already been streamed, so a client never
/// executes a partial tool call.
pub fn render_openai_error_terminator(
    stream_id: &str,
    created: i64,
    model: &str,
    message: &str,
    state: &OpenAiStreamState,
) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    if !state.saw_tool_calls {
        frames.push(SseFrame::data(
            json!({
                "id": stream_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{"index": 0, "delta": {"content": format!("\n\n[error: {message}]")}, "finish_reason": null}]
            })
            .to_string(),
        ));
    }
    frames.push(SseFrame::data(
        json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        })
        .to_string(),
    ));
    frames.push(SseFrame::done());
    frames
}

/// Synthesizes a full streaming sequence out of a single non-streaming
/// response, for clients that requested `stream: true` against an upstream
/// call that answered all at once (§4.9): role-only first chunk, content
/// deltas, one tool-call-delta pair per call (index-keyed), then a terminal
/// chunk with populated `finish_reason`/usage, then `[DONE]`.
pub fn synthesize_openai_stream(
    stream_id: &str,
    created: i64,
    model: &str,
    content: &str,
    tool_calls: &[ToolCall],
    finish_reason: &str,
    usage: Option<Value>,
) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    frames.push(SseFrame::data(
        json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
        })
        .to_string(),
    ));

    if !content.is_empty() {
        frames.push(SseFrame::data(
            json!({
                "id": stream_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
            })
            .to_string(),
        ));
    }

    for (index, call) in tool_calls.iter().enumerate() {
        frames.push(SseFrame::data(
            json!({
                "id": stream_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": {"tool_calls": [{
                        "index": index,
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.function.name, "arguments": call.function.arguments}
                    }]},
                    "finish_reason": null
                }]
            })
            .to_string(),
        ));
    }

    let mut terminal = json!({
        "id": stream_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{"index": 0, "delta": {}, "finish_reason": finish_reason}]
    });
    if let Some(usage) = usage {
        terminal["usage"] = usage;
    }
    frames.push(SseFrame::data(terminal.to_string()));
    frames.push(SseFrame::done());
    frames
}

/// Per-stream accumulator for the Anthropic named-event sequence.
#[derive(Default)]
pub struct AnthropicStreamState {
    content_block_open: bool,
    block_index: i64,
    saw_tool_calls: bool,
}

/// Emits Anthropic's `message_start` event, the first frame of every
/// Anthropic stream regardless of dialect bridging (§4.9).
pub fn render_anthropic_message_start(message_id: &str, model: &str) -> SseFrame {
    SseFrame::named(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "usage": {"input_tokens": 0, "output_tokens": 0}
            }
        })
        .to_string(),
    )
}

/// Renders one upstream event into the Anthropic named-event sequence.
pub fn render_anthropic_chunk(event: UpstreamEvent, state: &mut AnthropicStreamState) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    match event {
        UpstreamEvent::Text(text) => {
            if text.is_empty() {
                return frames;
            }
            if !state.content_block_open {
                frames.push(SseFrame::named(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": state.block_index,
                        "content_block": {"type": "text", "text": ""}
                    })
                    .to_string(),
                ));
                state.content_block_open = true;
            }
            frames.push(SseFrame::named(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "text_delta", "text": text}
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseStart { index: _, id, name } => {
            close_text_block(&mut frames, state);
            state.saw_tool_calls = true;
            state.block_index += 1;
            frames.push(SseFrame::named(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": state.block_index,
                    "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseInputDelta { index: _, partial_json } => {
            frames.push(SseFrame::named(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": state.block_index,
                    "delta": {"type": "input_json_delta", "partial_json": partial_json}
                })
                .to_string(),
            ));
        }
        UpstreamEvent::ToolUseComplete { .. } => {
            frames.push(SseFrame::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": state.block_index}).to_string(),
            ));
        }
        UpstreamEvent::Done { stop_reason } => {
            close_text_block(&mut frames, state);
            let mapped = match stop_reason.as_str() {
                "tool_calls" | "tool_use" => "tool_use",
                "length" | "max_tokens" => "max_tokens",
                _ => "end_turn",
            };
            let mapped = if state.saw_tool_calls { "tool_use" } else { mapped };
            frames.push(SseFrame::named(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": mapped, "stop_sequence": null},
                    "usage": {"output_tokens": 0}
                })
                .to_string(),
            ));
            frames.push(SseFrame::named(
                "message_stop",
                json!({"type": "message_stop"}).to_string(),
            ));
        }
    }
    frames
}

fn close_text_block(frames: &mut Vec<SseFrame>, state: &mut AnthropicStreamState) {
    if state.content_block_open {
        frames.push(SseFrame::named(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": state.block_index}).to_string(),
        ));
        state.content_block_open = false;
    }
}

/// Anthropic's keep-alive ping frame, used verbatim regardless of whether
/// content has started — Anthropic's named-event protocol has no
/// content-bearing idle frame the way OpenAI's chunk framing does.
pub fn render_anthropic_ping() -> SseFrame {
    SseFrame::named("ping", json!({"type": "ping"}).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }
    }

    #[test]
    fn empty_text_chunk_emits_nothing() {
        let mut state = OpenAiStreamState::default();
        let frames = render_openai_chunk("id", 0, "m", UpstreamEvent::Text(String::new()), &mut state);
        assert!(frames.is_empty());
    }

    #[test]
    fn done_without_tool_calls_uses_stop() {
        let mut state = OpenAiStreamState::default();
        let frames = render_openai_chunk(
            "id",
            0,
            "m",
            UpstreamEvent::Done { stop_reason: "end_turn".into() },
            &mut state,
        );
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("\"finish_reason\":\"stop\""));
        assert!(state.finished);
    }

    #[test]
    fn done_after_tool_use_reports_tool_calls() {
        let mut state = OpenAiStreamState::default();
        render_openai_chunk(
            "id",
            0,
            "m",
            UpstreamEvent::ToolUseStart { index: 0, id: "call_1".into(), name: "f".into() },
            &mut state,
        );
        let frames = render_openai_chunk(
            "id",
            0,
            "m",
            UpstreamEvent::Done { stop_reason: "tool_calls".into() },
            &mut state,
        );
        assert!(frames[0].data.contains("\"finish_reason\":\"tool_calls\""));
    }

    #[test]
    fn ping_before_data_is_blank_frame() {
        let frame = render_openai_ping("id", 0, "m", false);
        assert_eq!(frame.data, "");
    }

    #[test]
    fn ping_after_data_carries_id_and_model() {
        let frame = render_openai_ping("id-1", 0, "gpt-4.1", true);
        assert!(frame.data.contains("id-1"));
        assert!(frame.data.contains("gpt-4.1"));
    }

    #[test]
    fn error_terminator_never_reports_tool_calls_and_skips_content_after_tool_deltas() {
        let mut state = OpenAiStreamState::default();
        render_openai_chunk(
            "id",
            0,
            "m",
            UpstreamEvent::ToolUseStart { index: 0, id: "call_1".into(), name: "f".into() },
            &mut state,
        );
        let frames = render_openai_error_terminator("id", 0, "m", "boom", &state);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].data.contains("\"finish_reason\":\"stop\""));
        assert!(!frames[0].data.contains("delta\":{\"content\""));
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn error_terminator_without_tool_calls_includes_error_content() {
        let state = OpenAiStreamState::default();
        let frames = render_openai_error_terminator("id", 0, "m", "boom", &state);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].data.contains("boom"));
        assert_eq!(frames[2].data, "[DONE]");
    }

    #[test]
    fn synthesized_stream_has_role_content_and_done() {
        let frames = synthesize_openai_stream(
            "id",
            0,
            "m",
            "hello",
            &[tool_call("call_1", "f", "{}")],
            "stop",
            Some(json!({"total_tokens": 5})),
        );
        assert!(frames[0].data.contains("\"role\":\"assistant\""));
        assert!(frames.iter().any(|f| f.data.contains("hello")));
        assert!(frames.iter().any(|f| f.data.contains("call_1")));
        assert_eq!(frames.last().unwrap(), &SseFrame::done());
    }

    #[test]
    fn anthropic_text_opens_and_stream_stop_closes_block() {
        let mut state = AnthropicStreamState::default();
        let frames = render_anthropic_chunk(UpstreamEvent::Text("hi".into()), &mut state);
        assert_eq!(frames[0].event.as_deref(), Some("content_block_start"));
        assert_eq!(frames[1].event.as_deref(), Some("content_block_delta"));

        let done = render_anthropic_chunk(UpstreamEvent::Done { stop_reason: "stop".into() }, &mut state);
        assert_eq!(done[0].event.as_deref(), Some("content_block_stop"));
        assert_eq!(done[1].event.as_deref(), Some("message_delta"));
        assert!(done[1].data.contains("end_turn"));
        assert_eq!(done[2].event.as_deref(), Some("message_stop"));
    }

    #[test]
    fn anthropic_tool_use_maps_stop_reason_to_tool_use() {
        let mut state = AnthropicStreamState::default();
        render_anthropic_chunk(
            UpstreamEvent::ToolUseStart { index: 0, id: "call_1".into(), name: "f".into() },
            &mut state,
        );
        let done = render_anthropic_chunk(UpstreamEvent::Done { stop_reason: "stop".into() }, &mut state);
        assert!(done.iter().any(|f| f.data.contains("tool_use")));
    }
}
