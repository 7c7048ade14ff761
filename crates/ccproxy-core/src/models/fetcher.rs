use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

use ccproxy_common::{ProxyError, ProxyResult};

use super::card::ModelCard;

/// Public model-metadata catalogue the registry refreshes from.
const DEFAULT_SOURCE_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

/// Fetches model cards from the catalogue URL, with an on-disk JSON cache
/// so restarts and offline runs keep working.
pub struct ModelFetcher {
    source_url: String,
    cache_dir: PathBuf,
    client: wreq::Client,
}

impl ModelFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_source_url(cache_dir, DEFAULT_SOURCE_URL)
    }

    pub fn with_source_url(cache_dir: impl Into<PathBuf>, source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            cache_dir: cache_dir.into(),
            client: wreq::Client::new(),
        }
    }

    fn cache_path(&self, provider: &str) -> PathBuf {
        self.cache_dir.join(format!("models-{provider}.json"))
    }

    pub async fn fetch_provider_models(
        &self,
        provider: &str,
        use_cache: bool,
    ) -> ProxyResult<Vec<ModelCard>> {
        if use_cache {
            if let Some(cards) = self.read_cache(provider).await {
                debug!(event = "model_cache_hit", provider, count = cards.len());
                return Ok(cards);
            }
        }

        let catalogue = self.download().await?;
        let cards = parse_catalogue(&catalogue, provider);
        if let Err(err) = self.write_cache(provider, &cards).await {
            warn!(event = "model_cache_write_failed", provider, error = %err);
        }
        Ok(cards)
    }

    async fn download(&self) -> ProxyResult<Value> {
        let resp = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProxyError::UpstreamTransport(format!(
                "model catalogue fetch failed: {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| ProxyError::internal(err.to_string()))
    }

    async fn read_cache(&self, provider: &str) -> Option<Vec<ModelCard>> {
        let raw = tokio::fs::read(self.cache_path(provider)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn write_cache(&self, provider: &str, cards: &[ModelCard]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let raw = serde_json::to_vec(cards).unwrap_or_default();
        let path = self.cache_path(provider);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await
    }
}

/// The catalogue is one flat object keyed by model id; each entry names its
/// provider under `litellm_provider`.
fn parse_catalogue(catalogue: &Value, provider: &str) -> Vec<ModelCard> {
    let Some(entries) = catalogue.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(model_id, entry)| {
            let entry_provider = entry.get("litellm_provider").and_then(Value::as_str)?;
            if entry_provider != provider {
                return None;
            }
            Some(ModelCard {
                id: model_id.clone(),
                provider: provider.to_string(),
                owned_by: Some(entry_provider.to_string()),
                max_input_tokens: entry.get("max_input_tokens").and_then(Value::as_i64),
                max_output_tokens: entry.get("max_output_tokens").and_then(Value::as_i64),
                max_tokens: entry.get("max_tokens").and_then(Value::as_i64),
                supports_vision: entry
                    .get("supports_vision")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                supports_function_calling: entry
                    .get("supports_function_calling")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                supports_response_schema: entry
                    .get("supports_response_schema")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                input_cost_per_token: entry.get("input_cost_per_token").and_then(Value::as_f64),
                output_cost_per_token: entry
                    .get("output_cost_per_token")
                    .and_then(Value::as_f64),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalogue_parsing_filters_by_provider() {
        let catalogue = json!({
            "claude-3-5-sonnet-20241022": {
                "litellm_provider": "anthropic",
                "max_input_tokens": 200000,
                "max_output_tokens": 8192,
                "supports_vision": true,
                "supports_function_calling": true
            },
            "gpt-4o": {
                "litellm_provider": "openai",
                "max_input_tokens": 128000
            },
            "weird-entry": "not an object"
        });
        let cards = parse_catalogue(&catalogue, "anthropic");
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].id, "claude-3-5-sonnet-20241022");
        assert_eq!(cards[0].max_input_tokens, Some(200000));
        assert!(cards[0].supports_vision);
        assert!(!cards[0].supports_response_schema);
    }
}
