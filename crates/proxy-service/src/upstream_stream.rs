use std::collections::HashMap;

use proxy_core::{FunctionCall, ProxyError, ToolCall};
use proxy_runtime::UpstreamEvent;
use serde::Deserialize;
use serde_json::Value;

/// Per-index accumulator for a tool call whose `id`/`name` arrive on the
/// first delta and whose `arguments` arrive incrementally afterward.
#[derive(Default, Debug)]
struct ToolUseAccum {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

#[derive(Deserialize, Debug)]
struct RawStreamChunk {
    choices: Vec<RawStreamChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct RawStreamChoice {
    delta: RawStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct RawStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<RawStreamToolCall>>,
}

#[derive(Deserialize, Debug)]
struct RawStreamToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    function: RawStreamFunction,
}

#[derive(Deserialize, Debug, Default)]
struct RawStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

/// Incremental parser state carried across successive `Response::chunk()`
/// reads: a half-received SSE line can straddle two TCP reads, and tool-call
/// argument deltas must accumulate across the whole stream.
#[derive(Default)]
pub struct UpstreamSseParser {
    buffer: String,
    tool_states: HashMap<usize, ToolUseAccum>,
    done: bool,
}

impl UpstreamSseParser {
    pub fn new() -> Self {
        UpstreamSseParser::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds raw bytes from the upstream response body, returning every
    /// `UpstreamEvent` that could be fully parsed out of complete lines.
    /// Incomplete trailing lines are held in `buffer` for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<UpstreamEvent>, ProxyError> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim().to_string();
            self.buffer.drain(..=newline_pos);
            if self.done {
                continue;
            }
            if let Some(event) = self.parse_line(&line)? {
                events.extend(event);
            }
        }
        Ok(events)
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<Vec<UpstreamEvent>>, ProxyError> {
        if line.is_empty() {
            return Ok(None);
        }
        let data = match line.strip_prefix("data:") {
            Some(d) => d.trim(),
            None => return Ok(None),
        };
        if data == "[DONE]" {
            let mut events = self.drain_tool_completions();
            events.push(UpstreamEvent::Done { stop_reason: "end_turn".to_string() });
            self.done = true;
            return Ok(Some(events));
        }

        let chunk: RawStreamChunk = serde_json::from_str(data)
            .map_err(|e| ProxyError::JsonError(format!("malformed upstream stream chunk: {e}")))?;
        let mut events = Vec::new();

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                if !content.is_empty() {
                    events.push(UpstreamEvent::Text(content.clone()));
                }
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc in tool_calls {
                    let index = tc.index.unwrap_or(0);
                    let state = self.tool_states.entry(index).or_default();
                    if let Some(id) = &tc.id {
                        state.id = id.clone();
                    }
                    if let Some(name) = &tc.function.name {
                        state.name = name.clone();
                        if !state.started {
                            state.started = true;
                            events.push(UpstreamEvent::ToolUseStart {
                                index,
                                id: state.id.clone(),
                                name: state.name.clone(),
                            });
                        }
                    }
                    if !tc.function.arguments.is_empty() {
                        state.arguments.push_str(&tc.function.arguments);
                        events.push(UpstreamEvent::ToolUseInputDelta {
                            index,
                            partial_json: tc.function.arguments.clone(),
                        });
                    }
                }
            }
            if let Some(finish_reason) = &choice.finish_reason {
                events.extend(self.drain_tool_completions());
                let stop_reason = match finish_reason.as_str() {
                    "tool_calls" => "tool_use",
                    "length" => "max_tokens",
                    _ => "end_turn",
                };
                events.push(UpstreamEvent::Done { stop_reason: stop_reason.to_string() });
                self.done = true;
            }
        }
        Ok(Some(events))
    }

    fn drain_tool_completions(&mut self) -> Vec<UpstreamEvent> {
        self.tool_states
            .drain()
            .filter(|(_, s)| s.started)
            .map(|(index, s)| UpstreamEvent::ToolUseComplete {
                index,
                tool_call: ToolCall {
                    id: s.id,
                    call_type: "function".to_string(),
                    function: FunctionCall { name: s.name, arguments: s.arguments },
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta_chunk() {
        let mut parser = UpstreamSseParser::new();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":null}]}\n\n";
        let events = parser.feed(line.as_bytes()).unwrap();
        assert!(matches!(&events[0], UpstreamEvent::Text(t) if t == "hi"));
    }

    #[test]
    fn accumulates_tool_call_across_chunks_and_completes_on_finish() {
        let mut parser = UpstreamSseParser::new();
        let start = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"f\",\"arguments\":\"\"}}]},\"finish_reason\":null}]}\n";
        let delta = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"x\\\":1}\"}}]},\"finish_reason\":null}]}\n";
        let finish = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n";

        parser.feed(start.as_bytes()).unwrap();
        parser.feed(delta.as_bytes()).unwrap();
        let events = parser.feed(finish.as_bytes()).unwrap();

        let completed = events.iter().find_map(|e| match e {
            UpstreamEvent::ToolUseComplete { tool_call, .. } => Some(tool_call.clone()),
            _ => None,
        });
        let tool_call = completed.unwrap();
        assert_eq!(tool_call.function.arguments, "{\"x\":1}");
        assert!(matches!(events.last(), Some(UpstreamEvent::Done { .. })));
    }

    #[test]
    fn done_sentinel_terminates_the_stream() {
        let mut parser = UpstreamSseParser::new();
        parser.feed(b"data: [DONE]\n").unwrap();
        assert!(parser.is_done());
    }

    #[test]
    fn split_chunk_boundary_is_buffered_until_newline() {
        let mut parser = UpstreamSseParser::new();
        let first = parser.feed(b"data: {\"choices\":[{\"delta\"").unwrap();
        assert!(first.is_empty());
        let second = parser.feed(b":{\"content\":\"ok\"},\"finish_reason\":null}]}\n").unwrap();
        assert!(matches!(&second[0], UpstreamEvent::Text(t) if t == "ok"));
    }
}
