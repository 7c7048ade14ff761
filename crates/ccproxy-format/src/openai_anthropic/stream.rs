use std::collections::BTreeMap;

use ccproxy_protocol::SseFrame;
use serde_json::{Map, Value, json};

use crate::stream::StreamConverter;

use super::response::finish_reason;

#[derive(Debug, Clone)]
struct ToolCallInfo {
    id: String,
    name: String,
}

/// Stateful converter turning an Anthropic messages event stream into
/// OpenAI `chat.completion.chunk` frames.
///
/// Frames whose data is not valid JSON pass through untouched, and the
/// `[DONE]` sentinel is preserved; both are part of the SSE contract.
pub struct AnthropicToOpenAIChatStream {
    id: String,
    model: String,
    created: i64,
    tool_calls: BTreeMap<u64, ToolCallInfo>,
    finish_emitted: bool,
    done_emitted: bool,
}

impl AnthropicToOpenAIChatStream {
    pub fn new(created: i64) -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: "unknown".to_string(),
            created,
            tool_calls: BTreeMap::new(),
            finish_emitted: false,
            done_emitted: false,
        }
    }

    fn convert_event(&mut self, event: &Value) -> Vec<SseFrame> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                let message = event.get("message");
                if let Some(id) = message
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                {
                    self.id = id.to_string();
                }
                if let Some(model) = message
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                {
                    self.model = model.to_string();
                }
                vec![self.chunk(json!({"role": "assistant"}), None, None)]
            }
            "content_block_start" => self.block_start(event),
            "content_block_delta" => self.block_delta(event),
            "message_delta" => {
                let finish = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                    .map(|s| finish_reason(Some(s)));
                if finish.is_some() {
                    self.finish_emitted = true;
                }
                let usage = event.get("usage").and_then(Value::as_object).map(|usage| {
                    let input = usage
                        .get("input_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    let output = usage
                        .get("output_tokens")
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    json!({
                        "prompt_tokens": input,
                        "completion_tokens": output,
                        "total_tokens": input + output,
                    })
                });
                if finish.is_none() && usage.is_none() {
                    Vec::new()
                } else {
                    vec![self.chunk(json!({}), finish, usage)]
                }
            }
            "message_stop" => {
                let mut frames = Vec::new();
                if !self.finish_emitted {
                    self.finish_emitted = true;
                    frames.push(self.chunk(json!({}), Some("stop"), None));
                }
                self.done_emitted = true;
                frames.push(SseFrame::data("[DONE]"));
                frames
            }
            // Heartbeats have no chunk equivalent.
            "ping" => Vec::new(),
            "error" => {
                let (message, _) =
                    ccproxy_protocol::error_shape::extract_error_fields(event);
                vec![SseFrame::data(
                    ccproxy_protocol::error_shape::openai_error_body(
                        &message,
                        "server_error",
                        None,
                        None,
                    )
                    .to_string(),
                )]
            }
            _ => Vec::new(),
        }
    }

    fn block_start(&mut self, event: &Value) -> Vec<SseFrame> {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(block) = event.get("content_block") else {
            return Vec::new();
        };
        match block.get("type").and_then(Value::as_str) {
            Some("text") | Some("thinking") => {
                let text = block
                    .get("text")
                    .or_else(|| block.get("thinking"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![self.text_chunk(text)]
                }
            }
            Some("tool_use") => {
                if self.tool_calls.contains_key(&index) {
                    // Duplicate start for an index we already opened.
                    return Vec::new();
                }
                let info = ToolCallInfo {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                let delta = json!({
                    "tool_calls": [{
                        "index": index,
                        "id": info.id.clone(),
                        "type": "function",
                        "function": {"name": info.name.clone(), "arguments": ""},
                    }]
                });
                self.tool_calls.insert(index, info);
                vec![self.chunk(delta, None, None)]
            }
            _ => Vec::new(),
        }
    }

    fn block_delta(&mut self, event: &Value) -> Vec<SseFrame> {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(delta) = event.get("delta") else {
            return Vec::new();
        };
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => {
                let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![self.text_chunk(text)]
                }
            }
            Some("thinking_delta") => {
                let text = delta.get("thinking").and_then(Value::as_str).unwrap_or("");
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![self.text_chunk(text)]
                }
            }
            Some("input_json_delta") => {
                let partial = delta
                    .get("partial_json")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if partial.is_empty() {
                    return Vec::new();
                }
                let delta = json!({
                    "tool_calls": [{
                        "index": index,
                        "type": "function",
                        "function": {"arguments": partial},
                    }]
                });
                vec![self.chunk(delta, None, None)]
            }
            _ => Vec::new(),
        }
    }

    fn text_chunk(&self, text: &str) -> SseFrame {
        self.chunk(json!({"content": text}), None, None)
    }

    fn chunk(&self, delta: Value, finish: Option<&str>, usage: Option<Value>) -> SseFrame {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        body.insert(
            "object".to_string(),
            Value::String("chat.completion.chunk".to_string()),
        );
        body.insert("created".to_string(), Value::from(self.created));
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert(
            "choices".to_string(),
            json!([{
                "index": 0,
                "delta": delta,
                "finish_reason": finish.map(|f| Value::String(f.to_string())).unwrap_or(Value::Null),
            }]),
        );
        if let Some(usage) = usage {
            body.insert("usage".to_string(), usage);
        }
        SseFrame::data(Value::Object(body).to_string())
    }
}

impl StreamConverter for AnthropicToOpenAIChatStream {
    fn convert_frame(&mut self, frame: SseFrame) -> Vec<SseFrame> {
        if frame.is_done() {
            self.done_emitted = true;
            return vec![frame];
        }
        let Ok(event) = serde_json::from_str::<Value>(&frame.data) else {
            // Unparseable frames pass through; the adapter sees nothing.
            return vec![frame];
        };
        self.convert_event(&event)
    }

    fn finish(&mut self) -> Vec<SseFrame> {
        if self.done_emitted {
            Vec::new()
        } else {
            self.done_emitted = true;
            vec![SseFrame::data("[DONE]")]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: Value) -> SseFrame {
        SseFrame::named(event, data.to_string())
    }

    fn data_of(frames: &[SseFrame], index: usize) -> Value {
        serde_json::from_str(&frames[index].data).unwrap()
    }

    #[test]
    fn message_start_emits_role_chunk_with_identity() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let frames = stream.convert_frame(frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {"id": "msg_1", "model": "claude-3-5-sonnet-20241022",
                            "usage": {"input_tokens": 9}}
            }),
        ));
        let chunk = data_of(&frames, 0);
        assert_eq!(chunk["id"], "msg_1");
        assert_eq!(chunk["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
    }

    #[test]
    fn text_delta_becomes_content_delta() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let frames = stream.convert_frame(frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "hel"}
            }),
        ));
        assert_eq!(data_of(&frames, 0)["choices"][0]["delta"]["content"], "hel");
    }

    #[test]
    fn message_delta_carries_finish_and_usage() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let frames = stream.convert_frame(frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"input_tokens": 10, "output_tokens": 4}
            }),
        ));
        let chunk = data_of(&frames, 0);
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunk["usage"]["total_tokens"], 14);
    }

    #[test]
    fn message_stop_emits_done_sentinel() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        stream.finish_emitted = true;
        let frames = stream.convert_frame(frame(
            "message_stop",
            json!({"type": "message_stop"}),
        ));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
        assert!(stream.finish().is_empty());
    }

    #[test]
    fn unparseable_frame_passes_through() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let raw = SseFrame::data("not json at all");
        let frames = stream.convert_frame(raw.clone());
        assert_eq!(frames, vec![raw]);
    }

    #[test]
    fn tool_use_stream_emits_indexed_tool_call_chunks() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let start = stream.convert_frame(frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "f", "input": {}}
            }),
        ));
        let call = &data_of(&start, 0)["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 1);
        assert_eq!(call["function"]["name"], "f");

        let delta = stream.convert_frame(frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 1,
                "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}
            }),
        ));
        let call = &data_of(&delta, 0)["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["function"]["arguments"], "{\"a\":");
    }

    #[test]
    fn finish_appends_done_when_upstream_dropped() {
        let mut stream = AnthropicToOpenAIChatStream::new(1);
        let frames = stream.finish();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
    }
}
