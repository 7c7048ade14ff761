use ccproxy_protocol::blocks::{ContentBlock, KnownBlock};
use serde_json::{Map, Value, json};

use crate::adapter::{FormatError, FormatResult};

/// Anthropic requires `max_tokens`; applied when the OpenAI request names
/// neither `max_tokens` nor `max_completion_tokens`.
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Convert an OpenAI chat-completions request into an Anthropic messages
/// request. System and developer messages fold into the `system` field;
/// everything else maps message by message.
pub fn openai_to_anthropic(payload: &Value) -> FormatResult<Value> {
    let source = as_object(payload, "request")?;

    let mut system_texts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(items) = source.get("messages").and_then(Value::as_array) {
        for message in items {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("");
            match role {
                "system" | "developer" => {
                    if let Some(text) = text_content(message.get("content")) {
                        system_texts.push(text);
                    }
                }
                "tool" => messages.push(tool_message_to_anthropic(message)),
                "assistant" => messages.push(assistant_message_to_anthropic(message)),
                _ => messages.push(user_message_to_anthropic(message)),
            }
        }
    }

    let mut out = Map::new();
    out.insert(
        "model".to_string(),
        source.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "max_tokens".to_string(),
        Value::from(
            source
                .get("max_completion_tokens")
                .or_else(|| source.get("max_tokens"))
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        ),
    );
    if !system_texts.is_empty() {
        out.insert(
            "system".to_string(),
            Value::String(system_texts.join("\n")),
        );
    }
    for key in ["stream", "temperature", "top_p", "metadata"] {
        if let Some(value) = source.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(stop) = source.get("stop") {
        let sequences = match stop {
            Value::String(s) => vec![Value::String(s.clone())],
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        };
        if !sequences.is_empty() {
            out.insert("stop_sequences".to_string(), Value::Array(sequences));
        }
    }
    if let Some(tools) = source.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools.iter().filter_map(openai_tool_to_anthropic).collect();
        if !mapped.is_empty() {
            out.insert("tools".to_string(), Value::Array(mapped));
        }
    }
    if let Some(choice) = source.get("tool_choice") {
        if let Some(mapped) = openai_tool_choice_to_anthropic(choice) {
            out.insert("tool_choice".to_string(), mapped);
        }
    }

    Ok(Value::Object(out))
}

/// Convert an Anthropic messages request into an OpenAI chat request.
/// `system` becomes a leading system message; blocks flatten into OpenAI
/// content parts.
pub fn anthropic_to_openai(payload: &Value) -> FormatResult<Value> {
    let source = as_object(payload, "request")?;

    let mut messages: Vec<Value> = Vec::new();
    match source.get("system") {
        Some(Value::String(text)) => {
            messages.push(json!({"role": "system", "content": text}));
        }
        Some(Value::Array(blocks)) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if !texts.is_empty() {
                messages.push(json!({"role": "system", "content": texts.join("\n")}));
            }
        }
        _ => {}
    }

    if let Some(items) = source.get("messages").and_then(Value::as_array) {
        for message in items {
            messages.extend(anthropic_message_to_openai(message));
        }
    }

    let mut out = Map::new();
    out.insert(
        "model".to_string(),
        source.get("model").cloned().unwrap_or(Value::Null),
    );
    out.insert("messages".to_string(), Value::Array(messages));
    for key in ["stream", "temperature", "top_p"] {
        if let Some(value) = source.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(max_tokens) = source.get("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    if let Some(stop) = source.get("stop_sequences") {
        out.insert("stop".to_string(), stop.clone());
    }

    Ok(Value::Object(out))
}

fn as_object<'a>(
    payload: &'a Value,
    what: &str,
) -> FormatResult<&'a Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| FormatError::Convert(format!("{what} body must be a JSON object")))
}

/// Plain-text view of an OpenAI `content` field (string or text parts).
fn text_content(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn user_message_to_anthropic(message: &Value) -> Value {
    let content = match message.get("content") {
        Some(Value::String(text)) => Value::String(text.clone()),
        Some(Value::Array(parts)) => {
            let blocks: Vec<Value> = parts.iter().filter_map(openai_part_to_block).collect();
            Value::Array(blocks)
        }
        _ => Value::String(String::new()),
    };
    json!({"role": "user", "content": content})
}

fn openai_part_to_block(part: &Value) -> Option<Value> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => {
            let block = ContentBlock::text(part.get("text")?.as_str()?);
            serde_json::to_value(block).ok()
        }
        "image_url" => {
            let url = part.get("image_url")?.get("url")?.as_str()?;
            let source = match parse_data_url(url) {
                Some((media_type, data)) => json!({
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                }),
                None => json!({"type": "url", "url": url}),
            };
            Some(json!({"type": "image", "source": source}))
        }
        // Unknown part kinds ride along unchanged (forward compatibility).
        _ => Some(part.clone()),
    }
}

fn assistant_message_to_anthropic(message: &Value) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    if let Some(text) = text_content(message.get("content")) {
        if !text.is_empty() {
            blocks.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
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
            blocks.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }));
        }
    }
    json!({"role": "assistant", "content": blocks})
}

fn tool_message_to_anthropic(message: &Value) -> Value {
    let tool_use_id = message
        .get("tool_call_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let content = text_content(message.get("content")).unwrap_or_default();
    json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        }]
    })
}

fn anthropic_message_to_openai(message: &Value) -> Vec<Value> {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
    let content = message.get("content");

    let Some(Value::Array(raw_blocks)) = content else {
        // String content maps straight through.
        let text = content.and_then(Value::as_str).unwrap_or_default();
        return vec![json!({"role": role, "content": text})];
    };

    let mut out = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for raw in raw_blocks {
        let Ok(block) = serde_json::from_value::<ContentBlock>(raw.clone()) else {
            continue;
        };
        match block {
            ContentBlock::Known(KnownBlock::Text { text, .. }) => texts.push(text),
            ContentBlock::Known(KnownBlock::Thinking { thinking, .. }) => texts.push(thinking),
            ContentBlock::Known(KnownBlock::ToolUse { id, name, input, .. }) => {
                let arguments =
                    serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }));
            }
            ContentBlock::Known(KnownBlock::ToolResult { tool_use_id, content, .. }) => {
                let text = match content {
                    Some(Value::String(s)) => s,
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
            ContentBlock::Known(KnownBlock::Image { .. }) | ContentBlock::Passthrough(_) => {}
        }
    }

    if !texts.is_empty() || !tool_calls.is_empty() {
        let mut message = Map::new();
        message.insert("role".to_string(), Value::String(role.to_string()));
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
        out.insert(0, Value::Object(message));
    }

    out
}

fn openai_tool_to_anthropic(tool: &Value) -> Option<Value> {
    let function = tool.get("function")?;
    let name = function.get("name")?.as_str()?;
    let mut out = Map::new();
    out.insert("name".to_string(), Value::String(name.to_string()));
    if let Some(description) = function.get("description") {
        out.insert("description".to_string(), description.clone());
    }
    out.insert(
        "input_schema".to_string(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    );
    Some(Value::Object(out))
}

fn openai_tool_choice_to_anthropic(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            "none" => Some(json!({"type": "none"})),
            _ => None,
        },
        Value::Object(_) => {
            let name = choice.get("function")?.get("name")?.as_str()?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let url = url.strip_prefix("data:")?;
    let (meta, data) = url.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_folds_into_system_field() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "system", "content": "x"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 100,
            "stream": false
        });
        let out = openai_to_anthropic(&payload).unwrap();
        assert_eq!(out["system"], "x");
        assert_eq!(out["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(out["max_tokens"], 100);
        assert_eq!(out["stream"], false);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hi");
    }

    #[test]
    fn missing_max_tokens_gets_default() {
        let payload = json!({"model": "m", "messages": [{"role": "user", "content": "q"}]});
        let out = openai_to_anthropic(&payload).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let payload = json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]
            }]
        });
        let out = openai_to_anthropic(&payload).unwrap();
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "tool_use");
        assert_eq!(blocks[0]["name"], "get_weather");
        assert_eq!(blocks[0]["input"]["city"], "Paris");
    }

    #[test]
    fn tool_role_message_becomes_tool_result() {
        let payload = json!({
            "model": "m",
            "messages": [{"role": "tool", "tool_call_id": "call_1", "content": "sunny"}]
        });
        let out = openai_to_anthropic(&payload).unwrap();
        let block = &out["messages"][0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "call_1");
        assert_eq!(block["content"], "sunny");
    }

    #[test]
    fn data_url_image_becomes_base64_source() {
        let payload = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
                ]
            }]
        });
        let out = openai_to_anthropic(&payload).unwrap();
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["type"], "base64");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn anthropic_request_maps_back_to_openai() {
        let payload = json!({
            "model": "claude-3-5-haiku-20241022",
            "system": "be terse",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hello"}]
        });
        let out = anthropic_to_openai(&payload).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(messages[1]["content"], "hello");
        assert_eq!(out["max_tokens"], 64);
    }

    #[test]
    fn non_object_request_is_rejected() {
        assert!(openai_to_anthropic(&json!([1, 2, 3])).is_err());
    }
}
