use serde_json::{Value, json};

/// OpenAI-convention error body:
/// `{"error": {"message", "type", "param?", "code?"}}`.
pub fn openai_error_body(
    message: &str,
    error_type: &str,
    param: Option<&str>,
    code: Option<&str>,
) -> Value {
    let mut error = serde_json::Map::new();
    error.insert("message".to_string(), Value::String(message.to_string()));
    error.insert("type".to_string(), Value::String(error_type.to_string()));
    if let Some(param) = param {
        error.insert("param".to_string(), Value::String(param.to_string()));
    }
    if let Some(code) = code {
        error.insert("code".to_string(), Value::String(code.to_string()));
    }
    json!({ "error": Value::Object(error) })
}

/// Anthropic-convention error body:
/// `{"type": "error", "error": {"type", "message"}}`.
pub fn anthropic_error_body(message: &str, error_type: &str) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": message,
        }
    })
}

/// Pull `(message, type)` out of either envelope, for cross-dialect error
/// conversion. Unknown shapes yield a generic pair so conversion is total.
pub fn extract_error_fields(body: &Value) -> (String, String) {
    let error = body.get("error").unwrap_or(body);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream error")
        .to_string();
    let error_type = error
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("api_error")
        .to_string();
    (message, error_type)
}
