use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::card::ModelCard;
use super::fetcher::ModelFetcher;

const PROVIDERS: &[&str] = &["anthropic", "openai"];

#[derive(Default)]
struct Snapshot {
    by_provider: HashMap<String, HashMap<String, ModelCard>>,
    last_refresh: HashMap<String, Instant>,
}

/// Centralised model metadata with periodic refresh.
///
/// Readers take a snapshot under a read lock and always see either the old
/// or the new table; a single-flight lock keeps concurrent refreshes down
/// to one fetch.
pub struct ModelRegistry {
    fetcher: ModelFetcher,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
    refresh_gate: Mutex<()>,
}

impl ModelRegistry {
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

    pub fn new(fetcher: ModelFetcher) -> Self {
        Self::with_refresh_interval(fetcher, Self::DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(fetcher: ModelFetcher, refresh_interval: Duration) -> Self {
        Self {
            fetcher,
            refresh_interval,
            snapshot: RwLock::new(Snapshot::default()),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Initial population. A provider that fails to fetch starts empty and
    /// retries on the next refresh window.
    pub async fn initialize(self: &Arc<Self>) {
        for provider in PROVIDERS {
            self.refresh_provider(provider, true).await;
        }
        let snapshot = self.snapshot.read().await;
        info!(
            event = "model_registry_initialized",
            anthropic_models = snapshot
                .by_provider
                .get("anthropic")
                .map(HashMap::len)
                .unwrap_or(0),
            openai_models = snapshot
                .by_provider
                .get("openai")
                .map(HashMap::len)
                .unwrap_or(0)
        );
    }

    async fn needs_refresh(&self, provider: &str) -> bool {
        let snapshot = self.snapshot.read().await;
        match snapshot.last_refresh.get(provider) {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        }
    }

    async fn refresh_provider(self: &Arc<Self>, provider: &str, use_cache: bool) {
        let _gate = self.refresh_gate.lock().await;
        // Re-check under the gate: another caller may have just refreshed.
        if !self.needs_refresh(provider).await {
            return;
        }
        match self.fetcher.fetch_provider_models(provider, use_cache).await {
            Ok(cards) => {
                let mut snapshot = self.snapshot.write().await;
                snapshot.by_provider.insert(
                    provider.to_string(),
                    cards.into_iter().map(|card| (card.id.clone(), card)).collect(),
                );
                snapshot
                    .last_refresh
                    .insert(provider.to_string(), Instant::now());
            }
            Err(err) => {
                warn!(event = "model_refresh_failed", provider, error = %err);
                let mut snapshot = self.snapshot.write().await;
                snapshot.by_provider.entry(provider.to_string()).or_default();
                snapshot
                    .last_refresh
                    .insert(provider.to_string(), Instant::now());
            }
        }
    }

    pub async fn get_model(
        self: &Arc<Self>,
        model_id: &str,
        provider: Option<&str>,
    ) -> Option<ModelCard> {
        match provider {
            Some(provider) => {
                if self.needs_refresh(provider).await {
                    self.refresh_provider(provider, true).await;
                }
                let snapshot = self.snapshot.read().await;
                snapshot.by_provider.get(provider)?.get(model_id).cloned()
            }
            None => {
                let snapshot = self.snapshot.read().await;
                for models in snapshot.by_provider.values() {
                    if let Some(card) = models.get(model_id) {
                        return Some(card.clone());
                    }
                }
                None
            }
        }
    }

    pub async fn all_models(self: &Arc<Self>) -> Vec<ModelCard> {
        let snapshot = self.snapshot.read().await;
        let mut out: Vec<ModelCard> = snapshot
            .by_provider
            .values()
            .flat_map(|models| models.values().cloned())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Seed cards directly; used by tests and by provider plugins that ship
    /// static defaults.
    pub async fn insert_models(&self, provider: &str, cards: Vec<ModelCard>) {
        let mut snapshot = self.snapshot.write().await;
        let table = snapshot.by_provider.entry(provider.to_string()).or_default();
        for card in cards {
            table.insert(card.id.clone(), card);
        }
        snapshot
            .last_refresh
            .insert(provider.to_string(), Instant::now());
    }

    pub async fn stats(&self) -> HashMap<String, usize> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .by_provider
            .iter()
            .map(|(provider, models)| (provider.clone(), models.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ModelRegistry> {
        let cache = std::env::temp_dir().join(format!("ccproxy-models-{}", std::process::id()));
        Arc::new(ModelRegistry::new(ModelFetcher::new(cache)))
    }

    #[tokio::test]
    async fn seeded_models_resolve_by_provider_and_globally() {
        let registry = registry();
        registry
            .insert_models(
                "anthropic",
                vec![ModelCard {
                    id: "claude-3-5-sonnet-20241022".into(),
                    provider: "anthropic".into(),
                    max_input_tokens: Some(200000),
                    ..ModelCard::default()
                }],
            )
            .await;

        let by_provider = registry
            .get_model("claude-3-5-sonnet-20241022", Some("anthropic"))
            .await
            .unwrap();
        assert_eq!(by_provider.max_input_tokens, Some(200000));

        let global = registry
            .get_model("claude-3-5-sonnet-20241022", None)
            .await
            .unwrap();
        assert_eq!(global.id, by_provider.id);

        assert!(registry.get_model("missing", None).await.is_none());
    }

    #[tokio::test]
    async fn stats_count_per_provider() {
        let registry = registry();
        registry
            .insert_models(
                "openai",
                vec![
                    ModelCard::new("gpt-5", "openai"),
                    ModelCard::new("gpt-5-codex", "openai"),
                ],
            )
            .await;
        assert_eq!(registry.stats().await.get("openai"), Some(&2));
    }
}
