use std::collections::HashMap;

use ccproxy_protocol::Dialect;
use serde_json::Value;

/// Per-request state created by ingress middleware and threaded through the
/// pipeline. Mutable fields fill in as stages run.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    /// `endpoint`, `service_type` and friends.
    pub metadata: HashMap<String, String>,
    /// Declared translation path for this route; empty means native.
    pub format_chain: Vec<Dialect>,
    /// Model card resolved by the validation middleware, when one matched.
    pub model_card: Option<Value>,
    /// Input tokens counted by the validation middleware.
    pub input_tokens: Option<i64>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> &str {
        self.metadata.get("endpoint").map(String::as_str).unwrap_or("")
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.metadata
            .insert("endpoint".to_string(), endpoint.to_string());
        self
    }

    pub fn with_chain(mut self, chain: Vec<Dialect>) -> Self {
        self.format_chain = chain;
        self
    }

    /// The client-facing dialect, when a chain is declared.
    pub fn client_dialect(&self) -> Option<Dialect> {
        self.format_chain.first().copied()
    }

    /// The provider-facing dialect, when a chain is declared.
    pub fn provider_dialect(&self) -> Option<Dialect> {
        self.format_chain.last().copied()
    }
}
