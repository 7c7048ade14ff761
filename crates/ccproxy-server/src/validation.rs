//! Model validation against registry metadata, applied to every
//! chat/completion route before the pipeline runs. A rejected request never
//! touches the upstream pool.

use serde_json::Value;

use ccproxy_common::ProxyError;
use ccproxy_core::{ModelCard, TokenCounter};

#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub validate_token_limits: bool,
    pub enforce_capabilities: bool,
    pub warn_on_limits: bool,
    /// Fraction of the input window that triggers `X-Model-Warning`.
    pub warn_threshold: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            validate_token_limits: true,
            enforce_capabilities: true,
            warn_on_limits: true,
            warn_threshold: 0.9,
        }
    }
}

/// What validation learned about the request; warnings become repeated
/// `X-Model-Warning` headers on the response.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub warnings: Vec<String>,
    pub input_tokens: Option<i64>,
    pub card: Option<ModelCard>,
}

/// Provider inference by path substring. Ambiguous paths yield `None` and
/// validation is skipped silently rather than erroring.
pub fn infer_provider(path: &str) -> Option<&'static str> {
    let lowered = path.to_ascii_lowercase();
    if lowered.contains("claude") || lowered.contains("/messages") {
        return Some("anthropic");
    }
    if lowered.contains("codex") || lowered.contains("openai") {
        return Some("openai");
    }
    None
}

pub fn should_validate(path: &str) -> bool {
    const VALIDATE_SUFFIXES: &[&str] = &["/chat/completions", "/messages", "/responses"];
    VALIDATE_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Run the checks against a resolved model card. Order matters: limits
/// first, then capabilities; the first failure wins.
pub fn validate_request(
    settings: &ValidationSettings,
    card: Option<ModelCard>,
    payload: &Value,
    counter: &TokenCounter,
) -> Result<ValidationOutcome, ProxyError> {
    let mut outcome = ValidationOutcome::default();
    let Some(card) = card else {
        // Unknown model: nothing to enforce.
        return Ok(outcome);
    };

    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let system = payload.get("system");

    let input_tokens = if settings.validate_token_limits || settings.warn_on_limits {
        Some(counter.count_messages_tokens(&messages, &card.id, system))
    } else {
        None
    };
    outcome.input_tokens = input_tokens;

    if settings.validate_token_limits {
        if let (Some(input_tokens), Some(max_input)) = (input_tokens, card.max_input_tokens) {
            if input_tokens > max_input {
                return Err(ProxyError::Validation {
                    message: format!(
                        "Input exceeds model limit: {input_tokens} tokens sent, but {} supports max {max_input} input tokens",
                        card.id
                    ),
                    param: Some("messages".into()),
                    code: Some("context_length_exceeded".into()),
                });
            }
        }
        let requested_output = payload.get("max_tokens").and_then(Value::as_i64);
        if let (Some(requested), Some(max_output)) = (requested_output, card.max_output_tokens) {
            if requested > max_output {
                return Err(ProxyError::Validation {
                    message: format!(
                        "Requested output exceeds model limit: {requested} tokens requested, but {} supports max {max_output} output tokens",
                        card.id
                    ),
                    param: Some("max_tokens".into()),
                    code: Some("max_tokens_exceeded".into()),
                });
            }
        }
    }

    if settings.warn_on_limits {
        if let (Some(input_tokens), Some(max_input)) = (input_tokens, card.max_input_tokens) {
            let threshold = max_input as f64 * settings.warn_threshold;
            if input_tokens as f64 > threshold {
                let percentage = input_tokens as f64 / max_input as f64 * 100.0;
                outcome.warnings.push(format!(
                    "Input tokens ({input_tokens}) at {percentage:.1}% of model limit ({max_input})"
                ));
            }
        }
    }

    if settings.enforce_capabilities {
        if has_vision_content(&messages) && !card.supports_vision {
            return Err(ProxyError::Validation {
                message: format!("Model {} does not support vision/image inputs", card.id),
                param: Some("messages".into()),
                code: Some("unsupported_content_type".into()),
            });
        }

        let has_tools = payload.get("tools").and_then(Value::as_array).is_some();
        let has_functions = payload.get("functions").and_then(Value::as_array).is_some();
        if (has_tools || has_functions) && !card.supports_function_calling {
            return Err(ProxyError::Validation {
                message: format!("Model {} does not support function calling", card.id),
                param: Some(if has_tools { "tools" } else { "functions" }.into()),
                code: Some("unsupported_feature".into()),
            });
        }

        if let Some(format_type) = payload
            .get("response_format")
            .and_then(|format| format.get("type"))
            .and_then(Value::as_str)
        {
            if matches!(format_type, "json_object" | "json_schema")
                && !card.supports_response_schema
            {
                return Err(ProxyError::Validation {
                    message: format!("Model {} does not support structured output", card.id),
                    param: Some("response_format".into()),
                    code: Some("unsupported_feature".into()),
                });
            }
        }
    }

    outcome.card = Some(card);
    Ok(outcome)
}

fn has_vision_content(messages: &[Value]) -> bool {
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts.iter().any(|part| {
                    matches!(
                        part.get("type").and_then(Value::as_str),
                        Some("image") | Some("image_url")
                    )
                })
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card(max_input: i64) -> ModelCard {
        ModelCard {
            id: "claude-3-5-sonnet-20241022".into(),
            provider: "anthropic".into(),
            max_input_tokens: Some(max_input),
            max_output_tokens: Some(1000),
            supports_vision: false,
            supports_function_calling: false,
            supports_response_schema: false,
            ..ModelCard::default()
        }
    }

    fn counter() -> TokenCounter {
        TokenCounter::new()
    }

    #[test]
    fn provider_inference_follows_path_substrings() {
        assert_eq!(infer_provider("/v1/messages"), Some("anthropic"));
        assert_eq!(infer_provider("/claude/v1/chat/completions"), Some("anthropic"));
        assert_eq!(infer_provider("/codex/responses"), Some("openai"));
        assert_eq!(infer_provider("/openai/v1/chat/completions"), Some("openai"));
        // Ambiguous paths fall through; validation is then skipped.
        assert_eq!(infer_provider("/v1/chat/completions"), None);
    }

    #[test]
    fn oversized_input_is_context_length_exceeded() {
        // ~1500 tokens of text against a 1000-token window.
        let text = "word ".repeat(1500);
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": text}]
        });
        let err = validate_request(
            &ValidationSettings::default(),
            Some(card(1000)),
            &payload,
            &counter(),
        )
        .unwrap_err();
        assert_eq!(err.wire_code(), Some("context_length_exceeded"));
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn oversized_max_tokens_is_rejected() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 5000,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let err = validate_request(
            &ValidationSettings::default(),
            Some(card(100000)),
            &payload,
            &counter(),
        )
        .unwrap_err();
        assert_eq!(err.wire_code(), Some("max_tokens_exceeded"));
    }

    #[test]
    fn vision_content_requires_the_capability() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{
                "role": "user",
                "content": [{"type": "image", "source": {"data": "x"}}]
            }]
        });
        let err = validate_request(
            &ValidationSettings::default(),
            Some(card(100000)),
            &payload,
            &counter(),
        )
        .unwrap_err();
        assert_eq!(err.wire_code(), Some("unsupported_content_type"));
    }

    #[test]
    fn tools_require_function_calling() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f"}]
        });
        let err = validate_request(
            &ValidationSettings::default(),
            Some(card(100000)),
            &payload,
            &counter(),
        )
        .unwrap_err();
        assert_eq!(err.wire_code(), Some("unsupported_feature"));
        assert_eq!(err.wire_param(), Some("tools"));
    }

    #[test]
    fn response_format_requires_schema_support() {
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "json_schema"}
        });
        let err = validate_request(
            &ValidationSettings::default(),
            Some(card(100000)),
            &payload,
            &counter(),
        )
        .unwrap_err();
        assert_eq!(err.wire_code(), Some("unsupported_feature"));
    }

    #[test]
    fn near_limit_input_warns_without_failing() {
        let text = "word ".repeat(950);
        let payload = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": text}]
        });
        let outcome = validate_request(
            &ValidationSettings::default(),
            Some(card(1300)),
            &payload,
            &counter(),
        )
        .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("% of model limit"));
    }

    #[test]
    fn unknown_model_skips_validation() {
        let payload = json!({
            "model": "mystery",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f"}]
        });
        let outcome =
            validate_request(&ValidationSettings::default(), None, &payload, &counter()).unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(outcome.card.is_none());
    }
}
