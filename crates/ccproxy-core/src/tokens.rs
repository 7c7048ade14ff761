use serde_json::Value;
use tiktoken_rs::{CoreBPE, get_bpe_from_model, o200k_base};

// Counting heuristics for models without an exact tokenizer.
const CHARS_PER_TOKEN: usize = 4;
const IMAGE_TOKEN_OVERHEAD: i64 = 85;
const MESSAGE_FORMATTING_OVERHEAD: i64 = 4;
const ANTHROPIC_MESSAGE_OVERHEAD: i64 = 3;
const COMPLETION_TOKENS_OVERHEAD: i64 = 2;

/// Token counting with an exact tokenizer when the model resolves to one,
/// and a ⌈chars/4⌉ approximation otherwise.
pub struct TokenCounter {
    fallback_bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            fallback_bpe: o200k_base().ok(),
        }
    }

    pub fn count_tokens(&self, text: &str, model: &str) -> i64 {
        if let Ok(bpe) = get_bpe_from_model(model) {
            return bpe.encode_ordinary(text).len() as i64;
        }
        if let Some(bpe) = &self.fallback_bpe {
            if !model.starts_with("claude-") {
                return bpe.encode_ordinary(text).len() as i64;
            }
        }
        (text.chars().count() / CHARS_PER_TOKEN) as i64
    }

    /// Count a decoded `messages` array, dispatching on the model family:
    /// Anthropic message shapes for `claude-*`, OpenAI shapes otherwise.
    pub fn count_messages_tokens(
        &self,
        messages: &[Value],
        model: &str,
        system: Option<&Value>,
    ) -> i64 {
        if model.starts_with("claude-") {
            self.count_anthropic_messages(messages, system, model)
        } else {
            self.count_openai_messages(messages, model)
        }
    }

    fn count_openai_messages(&self, messages: &[Value], model: &str) -> i64 {
        let mut total = 0;
        for message in messages {
            total += MESSAGE_FORMATTING_OVERHEAD;
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                total += self.count_tokens(role, model);
            }
            total += self.count_content(message.get("content"), model);
            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    if let Some(function) = call.get("function") {
                        if let Some(name) = function.get("name").and_then(Value::as_str) {
                            total += self.count_tokens(name, model);
                        }
                        if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                            total += self.count_tokens(args, model);
                        }
                    }
                }
            }
        }
        total + COMPLETION_TOKENS_OVERHEAD
    }

    fn count_anthropic_messages(
        &self,
        messages: &[Value],
        system: Option<&Value>,
        model: &str,
    ) -> i64 {
        let mut total = 0;
        match system {
            Some(Value::String(text)) => total += self.count_tokens(text, model),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        total += self.count_tokens(text, model);
                    }
                }
            }
            _ => {}
        }
        for message in messages {
            total += ANTHROPIC_MESSAGE_OVERHEAD;
            if let Some(role) = message.get("role").and_then(Value::as_str) {
                total += self.count_tokens(role, model);
            }
            total += self.count_content(message.get("content"), model);
        }
        total
    }

    fn count_content(&self, content: Option<&Value>, model: &str) -> i64 {
        match content {
            Some(Value::String(text)) => self.count_tokens(text, model),
            Some(Value::Array(parts)) => {
                let mut total = 0;
                for part in parts {
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                total += self.count_tokens(text, model);
                            }
                        }
                        Some("image") | Some("image_url") => total += IMAGE_TOKEN_OVERHEAD,
                        Some("tool_use") => {
                            if let Some(input) = part.get("input") {
                                total += self.count_tokens(&input.to_string(), model);
                            }
                        }
                        Some("tool_result") => {
                            if let Some(text) = part.get("content").and_then(Value::as_str) {
                                total += self.count_tokens(text, model);
                            }
                        }
                        _ => {}
                    }
                }
                total
            }
            _ => 0,
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
