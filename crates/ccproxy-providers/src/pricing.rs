use std::collections::HashMap;

use ccproxy_plugin_core::{PricingService, StreamMetrics};

/// Per-token USD rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub cache_read_per_token: f64,
}

/// Static pricing table consulted by the streaming metrics side channel.
/// Models priced from the registry's catalogue can be merged in at startup.
pub struct StaticPricing {
    rates: HashMap<String, ModelRates>,
}

impl StaticPricing {
    pub fn new() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-3-5-sonnet-20241022".to_string(),
            ModelRates {
                input_per_token: 3e-6,
                output_per_token: 15e-6,
                cache_read_per_token: 0.3e-6,
            },
        );
        rates.insert(
            "claude-3-5-haiku-20241022".to_string(),
            ModelRates {
                input_per_token: 0.8e-6,
                output_per_token: 4e-6,
                cache_read_per_token: 0.08e-6,
            },
        );
        rates.insert(
            "gpt-5".to_string(),
            ModelRates {
                input_per_token: 1.25e-6,
                output_per_token: 10e-6,
                cache_read_per_token: 0.125e-6,
            },
        );
        rates.insert(
            "gpt-5-codex".to_string(),
            ModelRates {
                input_per_token: 1.25e-6,
                output_per_token: 10e-6,
                cache_read_per_token: 0.125e-6,
            },
        );
        Self { rates }
    }

    pub fn insert(&mut self, model: impl Into<String>, rates: ModelRates) {
        self.rates.insert(model.into(), rates);
    }
}

impl Default for StaticPricing {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingService for StaticPricing {
    fn cost_usd(&self, model: &str, metrics: &StreamMetrics) -> Option<f64> {
        let rates = self.rates.get(model)?;
        let input = metrics.tokens_input.unwrap_or(0) as f64;
        let output = metrics.tokens_output.unwrap_or(0) as f64;
        let cached = metrics.cache_read_tokens.unwrap_or(0) as f64;
        // Cached input tokens bill at the cache rate, not the input rate.
        let billed_input = (input - cached).max(0.0);
        Some(
            billed_input * rates.input_per_token
                + cached * rates.cache_read_per_token
                + output * rates.output_per_token,
        )
    }
}
