use ccproxy_protocol::error_shape::{
    anthropic_error_body, extract_error_fields, openai_error_body,
};
use serde_json::Value;

use crate::adapter::FormatResult;

/// Anthropic error envelope → OpenAI error envelope.
pub fn anthropic_to_openai(payload: &Value) -> FormatResult<Value> {
    let (message, error_type) = extract_error_fields(payload);
    Ok(openai_error_body(
        &message,
        &map_anthropic_type(&error_type),
        None,
        None,
    ))
}

/// OpenAI error envelope → Anthropic error envelope.
pub fn openai_to_anthropic(payload: &Value) -> FormatResult<Value> {
    let (message, error_type) = extract_error_fields(payload);
    Ok(anthropic_error_body(&message, &map_openai_type(&error_type)))
}

fn map_anthropic_type(error_type: &str) -> String {
    match error_type {
        "invalid_request_error" | "authentication_error" | "permission_error"
        | "not_found_error" | "rate_limit_error" => error_type.to_string(),
        "overloaded_error" => "server_error".to_string(),
        "api_error" => "server_error".to_string(),
        other => other.to_string(),
    }
}

fn map_openai_type(error_type: &str) -> String {
    match error_type {
        "server_error" => "api_error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_overloaded_becomes_server_error() {
        let payload = json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "try later"}
        });
        let out = anthropic_to_openai(&payload).unwrap();
        assert_eq!(out["error"]["type"], "server_error");
        assert_eq!(out["error"]["message"], "try later");
    }

    #[test]
    fn openai_server_error_becomes_api_error() {
        let payload = json!({
            "error": {"type": "server_error", "message": "boom"}
        });
        let out = openai_to_anthropic(&payload).unwrap();
        assert_eq!(out["type"], "error");
        assert_eq!(out["error"]["type"], "api_error");
    }

    #[test]
    fn invalid_request_passes_through_both_ways() {
        let payload = json!({
            "error": {"type": "invalid_request_error", "message": "bad"}
        });
        let there = openai_to_anthropic(&payload).unwrap();
        let back = anthropic_to_openai(&there).unwrap();
        assert_eq!(back["error"]["type"], "invalid_request_error");
        assert_eq!(back["error"]["message"], "bad");
    }
}
