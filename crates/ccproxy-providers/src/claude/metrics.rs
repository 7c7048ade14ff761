use ccproxy_plugin_core::{MetricsCollector, StreamMetrics};
use serde_json::Value;

/// Usage extraction from an Anthropic event stream: input and cache tokens
/// arrive on `message_start`, the final output count on `message_delta`.
#[derive(Debug, Default)]
pub struct AnthropicMetricsCollector {
    metrics: StreamMetrics,
    model: Option<String>,
}

impl AnthropicMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn absorb_usage(&mut self, usage: &Value) {
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) {
            self.metrics.tokens_input = Some(input);
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_i64) {
            self.metrics.tokens_output = Some(output);
        }
        if let Some(read) = usage.get("cache_read_input_tokens").and_then(Value::as_i64) {
            self.metrics.cache_read_tokens = Some(read);
        }
        if let Some(write) = usage
            .get("cache_creation_input_tokens")
            .and_then(Value::as_i64)
        {
            self.metrics.cache_write_tokens = Some(write);
        }
    }
}

impl MetricsCollector for AnthropicMetricsCollector {
    fn process_chunk(&mut self, chunk: &str) -> bool {
        let Ok(event) = serde_json::from_str::<Value>(chunk) else {
            return false;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = Some(model.to_string());
                    }
                    if let Some(usage) = message.get("usage") {
                        self.absorb_usage(usage);
                    }
                }
                false
            }
            Some("message_delta") => {
                let Some(usage) = event.get("usage") else {
                    return false;
                };
                self.absorb_usage(usage);
                self.metrics.tokens_output.is_some()
            }
            _ => false,
        }
    }

    fn metrics(&self) -> StreamMetrics {
        self.metrics.clone()
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }
}
