//! Copilot response normalization.
//!
//! GitHub's payloads drift from the canonical OpenAI schemas in small ways:
//! chat completions sometimes lack `created`, Responses payloads come back
//! with Anthropic-style stop reasons and loosely shaped output parts. The
//! normalizer rebuilds them; when the rebuilt payload still fails the shape
//! check the original body is returned untouched.

use serde_json::{Map, Value, json};
use tracing::debug;

/// Patch a chat completion missing its `created` timestamp. Returns `None`
/// when nothing needed patching.
pub fn patch_created_timestamp(payload: &Value, now_epoch: i64) -> Option<Value> {
    let obj = payload.as_object()?;
    if !obj.contains_key("choices") {
        return None;
    }
    if obj.get("created").and_then(Value::as_i64).is_some() {
        return None;
    }
    let mut patched = obj.clone();
    patched.insert("created".to_string(), Value::from(now_epoch));
    Some(Value::Object(patched))
}

/// Rebuild a Responses payload into the canonical schema. Returns `None`
/// when the rebuilt value does not validate; the caller then falls back to
/// the raw body.
pub fn normalize_response_payload(payload: &Value, now_epoch: i64) -> Option<Value> {
    let obj = payload.as_object()?;
    if validates_as_response(payload) {
        return Some(payload.clone());
    }

    let response_id = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("resp-{}", uuid::Uuid::new_v4().simple()));

    let stop_reason = obj.get("stop_reason").and_then(Value::as_str);
    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| map_stop_reason_to_status(stop_reason).to_string());

    let mut normalized = Map::new();
    normalized.insert("id".to_string(), Value::String(response_id.clone()));
    normalized.insert(
        "object".to_string(),
        obj.get("object")
            .cloned()
            .unwrap_or(Value::String("response".to_string())),
    );
    normalized.insert(
        "created_at".to_string(),
        obj.get("created_at")
            .and_then(Value::as_i64)
            .map(Value::from)
            .unwrap_or(Value::from(now_epoch)),
    );
    normalized.insert("status".to_string(), Value::String(status.clone()));
    normalized.insert(
        "model".to_string(),
        obj.get("model").cloned().unwrap_or(Value::String(String::new())),
    );
    normalized.insert(
        "parallel_tool_calls".to_string(),
        Value::Bool(
            obj.get("parallel_tool_calls")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
    );

    if let Some(usage) = obj.get("usage").and_then(Value::as_object) {
        normalized.insert("usage".to_string(), normalize_usage(usage));
    }

    let mut output = Vec::new();
    if let Some(items) = obj.get("output").and_then(Value::as_array) {
        for (index, item) in items.iter().enumerate() {
            let Some(item) = item.as_object() else {
                continue;
            };
            output.push(normalize_output_item(item, &response_id, &status, index));
        }
    }
    normalized.insert("output".to_string(), Value::Array(output));

    for key in [
        "metadata",
        "instructions",
        "max_output_tokens",
        "previous_response_id",
        "reasoning",
        "store",
        "temperature",
        "text",
        "tool_choice",
        "tools",
        "top_p",
        "truncation",
        "user",
    ] {
        if let Some(value) = obj.get(key) {
            if !value.is_null() {
                normalized.insert(key.to_string(), value.clone());
            }
        }
    }

    let normalized = Value::Object(normalized);
    if validates_as_response(&normalized) {
        Some(normalized)
    } else {
        debug!(event = "copilot_response_normalization_failed");
        None
    }
}

fn normalize_usage(usage: &Map<String, Value>) -> Value {
    let pick = |primary: &str, fallback: &str| -> i64 {
        usage
            .get(primary)
            .or_else(|| usage.get(fallback))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    let input_tokens = pick("input_tokens", "prompt_tokens");
    let output_tokens = pick("output_tokens", "completion_tokens");
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(input_tokens + output_tokens);
    let cached_tokens = usage
        .get("input_tokens_details")
        .and_then(|details| details.get("cached_tokens"))
        .or_else(|| usage.get("cached_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let reasoning_tokens = usage
        .get("output_tokens_details")
        .and_then(|details| details.get("reasoning_tokens"))
        .or_else(|| usage.get("reasoning_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    json!({
        "input_tokens": input_tokens,
        "input_tokens_details": {"cached_tokens": cached_tokens},
        "output_tokens": output_tokens,
        "output_tokens_details": {"reasoning_tokens": reasoning_tokens},
        "total_tokens": total_tokens,
    })
}

fn normalize_output_item(
    item: &Map<String, Value>,
    response_id: &str,
    status: &str,
    index: usize,
) -> Value {
    let mut out = item.clone();
    if out.get("id").and_then(Value::as_str).is_none() {
        out.insert(
            "id".to_string(),
            Value::String(format!("{response_id}_output_{index}")),
        );
    }
    if out.get("status").and_then(Value::as_str).is_none() {
        out.insert("status".to_string(), Value::String(status.to_string()));
    }
    if out.get("type").and_then(Value::as_str).is_none() {
        out.insert("type".to_string(), Value::String("message".to_string()));
    }
    if out.get("role").and_then(Value::as_str).is_none() {
        out.insert("role".to_string(), Value::String("assistant".to_string()));
    }

    let content = out
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let coerced: Vec<Value> = content
        .iter()
        .filter_map(|part| {
            let part = part.as_object()?;
            match part.get("type").and_then(Value::as_str) {
                Some("output_text") | Some("text") => Some(json!({
                    "type": "output_text",
                    "text": part.get("text").and_then(Value::as_str).unwrap_or(""),
                    "annotations": part.get("annotations").cloned().unwrap_or(json!([])),
                })),
                _ => Some(Value::Object(part.clone())),
            }
        })
        .collect();
    out.insert("content".to_string(), Value::Array(coerced));
    Value::Object(out)
}

fn map_stop_reason_to_status(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_output_tokens") => "incomplete",
        Some("cancelled") => "cancelled",
        _ => "completed",
    }
}

/// Shape check standing in for schema validation: the canonical response
/// needs its identity fields plus a message-shaped output list.
fn validates_as_response(payload: &Value) -> bool {
    let Some(obj) = payload.as_object() else {
        return false;
    };
    let has_identity = obj.get("id").and_then(Value::as_str).is_some()
        && obj.get("object").and_then(Value::as_str).is_some()
        && obj.get("status").and_then(Value::as_str).is_some()
        && obj.get("created_at").and_then(Value::as_i64).is_some()
        && obj.get("model").and_then(Value::as_str).is_some();
    if !has_identity {
        return false;
    }
    let Some(output) = obj.get("output").and_then(Value::as_array) else {
        return false;
    };
    output.iter().all(|item| {
        item.get("type").and_then(Value::as_str).is_some()
            && item.get("id").and_then(Value::as_str).is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_created_gets_patched() {
        let payload = json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "x"}}]
        });
        let patched = patch_created_timestamp(&payload, 1_750_000_000).unwrap();
        assert_eq!(patched["created"], 1_750_000_000);
    }

    #[test]
    fn present_created_is_left_alone() {
        let payload = json!({"choices": [], "created": 5});
        assert!(patch_created_timestamp(&payload, 99).is_none());
    }

    #[test]
    fn stop_reason_derives_status_and_usage_details_are_extracted() {
        let payload = json!({
            "model": "gpt-4o-copilot",
            "stop_reason": "max_output_tokens",
            "output": [{
                "content": [{"type": "text", "text": "partial"}]
            }],
            "usage": {
                "prompt_tokens": 50,
                "completion_tokens": 10,
                "input_tokens_details": {"cached_tokens": 20},
                "output_tokens_details": {"reasoning_tokens": 5}
            }
        });
        let normalized = normalize_response_payload(&payload, 1_000).unwrap();
        assert_eq!(normalized["status"], "incomplete");
        assert_eq!(normalized["created_at"], 1_000);
        assert_eq!(normalized["usage"]["input_tokens"], 50);
        assert_eq!(normalized["usage"]["input_tokens_details"]["cached_tokens"], 20);
        assert_eq!(
            normalized["usage"]["output_tokens_details"]["reasoning_tokens"],
            5
        );
        let part = &normalized["output"][0]["content"][0];
        assert_eq!(part["type"], "output_text");
        assert_eq!(part["text"], "partial");
        assert_eq!(normalized["output"][0]["role"], "assistant");
    }

    #[test]
    fn already_canonical_payload_passes_through() {
        let payload = json!({
            "id": "resp_1",
            "object": "response",
            "status": "completed",
            "created_at": 1,
            "model": "m",
            "output": [{"type": "message", "id": "msg_1", "content": []}]
        });
        assert_eq!(normalize_response_payload(&payload, 9).unwrap(), payload);
    }

    #[test]
    fn unbuildable_payload_yields_none() {
        // No model field and no way to derive one: identity check fails.
        let payload = json!({"output": "not-an-array", "model": null});
        assert!(normalize_response_payload(&payload, 1).is_none());
    }
}
