use ccproxy_protocol::blocks::{ContentBlock, KnownBlock};
use serde_json::{Map, Value, json};

use crate::adapter::{FormatError, FormatResult};

/// Convert an Anthropic message response into an OpenAI chat completion.
/// Text blocks join into the message content, tool_use blocks become
/// tool_calls, stop_reason maps onto finish_reason.
pub fn anthropic_to_openai(payload: &Value) -> FormatResult<Value> {
    let source = payload
        .as_object()
        .ok_or_else(|| FormatError::Convert("response body must be a JSON object".into()))?;

    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    if let Some(blocks) = source.get("content").and_then(Value::as_array) {
        for raw in blocks {
            let Ok(block) = serde_json::from_value::<ContentBlock>(raw.clone()) else {
                continue;
            };
            match block {
                ContentBlock::Known(KnownBlock::Text { text, .. }) => texts.push(text),
                ContentBlock::Known(KnownBlock::Thinking { thinking, .. }) => {
                    texts.push(thinking)
                }
                ContentBlock::Known(KnownBlock::ToolUse { id, name, input, .. }) => {
                    let arguments =
                        serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments},
                    }));
                }
                _ => {}
            }
        }
    }

    let stop_reason = source.get("stop_reason").and_then(Value::as_str);
    let mut message = Map::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert(
        "content".to_string(),
        if texts.is_empty() {
            Value::Null
        } else {
            Value::String(texts.join("\n"))
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    let mut out = Map::new();
    out.insert(
        "id".to_string(),
        source.get("id").cloned().unwrap_or(Value::String("chatcmpl-unknown".into())),
    );
    out.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    out.insert("created".to_string(), Value::from(0));
    out.insert(
        "model".to_string(),
        source.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "choices".to_string(),
        json!([{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason(stop_reason),
        }]),
    );
    if let Some(usage) = source.get("usage").and_then(Value::as_object) {
        let input = usage
            .get("input_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        out.insert(
            "usage".to_string(),
            json!({
                "prompt_tokens": input,
                "completion_tokens": output,
                "total_tokens": input + output,
            }),
        );
    }

    Ok(Value::Object(out))
}

/// Convert an OpenAI chat completion into an Anthropic message response.
/// Used when an Anthropic-native route is backed by an OpenAI-shaped
/// upstream.
pub fn openai_to_anthropic(payload: &Value) -> FormatResult<Value> {
    let source = payload
        .as_object()
        .ok_or_else(|| FormatError::Convert("response body must be a JSON object".into()))?;

    let choice = source
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
    {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let input = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }));
        }
    }

    let finish = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str);

    let mut out = Map::new();
    out.insert(
        "id".to_string(),
        source.get("id").cloned().unwrap_or(Value::String("msg_unknown".into())),
    );
    out.insert("type".to_string(), Value::String("message".to_string()));
    out.insert("role".to_string(), Value::String("assistant".to_string()));
    out.insert(
        "model".to_string(),
        source.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert("content".to_string(), Value::Array(content));
    out.insert(
        "stop_reason".to_string(),
        Value::String(stop_reason(finish).to_string()),
    );
    out.insert("stop_sequence".to_string(), Value::Null);
    if let Some(usage) = source.get("usage").and_then(Value::as_object) {
        out.insert(
            "usage".to_string(),
            json!({
                "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(Value::from(0)),
                "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(Value::from(0)),
            }),
        );
    }

    Ok(Value::Object(out))
}

pub(super) fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") | Some("model_context_window_exceeded") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

fn stop_reason(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        Some("content_filter") => "refusal",
        _ => "end_turn",
    }
}
