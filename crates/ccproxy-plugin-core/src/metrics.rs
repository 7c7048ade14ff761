use serde::{Deserialize, Serialize};

/// Token usage and cost collected from a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Per-request collector fed every SSE chunk of a streaming response.
///
/// `process_chunk` returns true once the chunk carrying complete usage has
/// been seen; callers may keep feeding chunks afterwards.
pub trait MetricsCollector: Send {
    fn process_chunk(&mut self, chunk: &str) -> bool;
    fn metrics(&self) -> StreamMetrics;
    /// Model learned from the stream, when the provider reports one.
    fn model(&self) -> Option<String> {
        None
    }
}

/// Collector for providers with no usage side channel.
#[derive(Debug, Default)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {
    fn process_chunk(&mut self, _chunk: &str) -> bool {
        false
    }

    fn metrics(&self) -> StreamMetrics {
        StreamMetrics::default()
    }
}

/// Synchronous pricing lookup. Errors are the caller's to swallow; a failed
/// price never fails a request.
pub trait PricingService: Send + Sync {
    fn cost_usd(&self, model: &str, metrics: &StreamMetrics) -> Option<f64>;
}
