use ccproxy_plugin_core::{MetricsCollector, StreamMetrics};
use serde_json::Value;

/// Usage extraction from OpenAI/Codex streams. Two shapes carry it: a
/// terminal `chat.completion.chunk`-style frame with non-null `usage`, or
/// the Codex `response.completed` event.
#[derive(Debug, Default)]
pub struct OpenAIMetricsCollector {
    metrics: StreamMetrics,
    model: Option<String>,
}

impl OpenAIMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn absorb_usage(&mut self, usage: &Value) -> bool {
        let input = usage
            .get("input_tokens")
            .or_else(|| usage.get("prompt_tokens"))
            .and_then(Value::as_i64);
        let output = usage
            .get("output_tokens")
            .or_else(|| usage.get("completion_tokens"))
            .and_then(Value::as_i64);
        if input.is_none() && output.is_none() {
            return false;
        }
        self.metrics.tokens_input = input.or(self.metrics.tokens_input);
        self.metrics.tokens_output = output.or(self.metrics.tokens_output);
        if let Some(cached) = usage
            .get("input_tokens_details")
            .and_then(|details| details.get("cached_tokens"))
            .and_then(Value::as_i64)
        {
            self.metrics.cache_read_tokens = Some(cached);
        }
        if let Some(reasoning) = usage
            .get("output_tokens_details")
            .and_then(|details| details.get("reasoning_tokens"))
            .and_then(Value::as_i64)
        {
            self.metrics.reasoning_tokens = Some(reasoning);
        }
        true
    }
}

impl MetricsCollector for OpenAIMetricsCollector {
    fn process_chunk(&mut self, chunk: &str) -> bool {
        let Ok(event) = serde_json::from_str::<Value>(chunk) else {
            return false;
        };

        // Codex event stream: usage lives on the completed response.
        if event.get("type").and_then(Value::as_str) == Some("response.completed") {
            if let Some(response) = event.get("response") {
                if let Some(model) = response.get("model").and_then(Value::as_str) {
                    self.model = Some(model.to_string());
                }
                if let Some(usage) = response.get("usage") {
                    return self.absorb_usage(usage);
                }
            }
            return false;
        }

        // Chat-chunk stream: only the final frame has non-null usage.
        let object = event.get("object").and_then(Value::as_str).unwrap_or("");
        if object.starts_with("chat.completion") || object.starts_with("codex.response") {
            if let Some(model) = event.get("model").and_then(Value::as_str) {
                self.model = Some(model.to_string());
            }
            if let Some(usage) = event.get("usage").filter(|usage| !usage.is_null()) {
                return self.absorb_usage(usage);
            }
        }
        false
    }

    fn metrics(&self) -> StreamMetrics {
        self.metrics.clone()
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }
}
