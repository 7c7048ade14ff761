//! Claude provider plugin: OAuth bearer auth, CLI fingerprint overlay,
//! system prompt injection, cache-control budgeting, metadata scrubbing.

mod detection;
mod metrics;
mod shape;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::debug;

use ccproxy_auth::{ClaudeTokenManager, TokenManager};
use ccproxy_common::{Headers, ProxyError, ProxyResult, header_get, header_set};
use ccproxy_plugin_core::{
    MetricsCollector, Plugin, PluginContext, PluginFactory, PluginManifest, PreparedRequest,
    ProviderAdapter, RequestContext,
};
use ccproxy_protocol::Dialect;

use crate::map_auth_error;

pub use detection::{ClaudeDetectionService, CliFingerprint};
pub use metrics::AnthropicMetricsCollector;
pub use shape::{
    MAX_CACHE_CONTROL_BLOCKS, SystemPromptInjectionMode, inject_system_prompt,
    limit_cache_control_blocks, remove_metadata_fields,
};

const PLUGIN_NAME: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub base_url: String,
    pub credentials_path: PathBuf,
    pub cache_dir: PathBuf,
    pub injection_mode: SystemPromptInjectionMode,
}

impl ClaudeConfig {
    pub fn new(credentials_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials_path,
            cache_dir,
            injection_mode: SystemPromptInjectionMode::default(),
        }
    }
}

pub struct ClaudeAdapter {
    config: ClaudeConfig,
    auth: Arc<ClaudeTokenManager>,
    detection: Arc<ClaudeDetectionService>,
}

impl ClaudeAdapter {
    pub fn new(
        config: ClaudeConfig,
        auth: Arc<ClaudeTokenManager>,
        detection: Arc<ClaudeDetectionService>,
    ) -> Self {
        Self {
            config,
            auth,
            detection,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn target_url(&self, _endpoint: &str) -> ProxyResult<String> {
        Ok(format!(
            "{}/v1/messages",
            self.config.base_url.trim_end_matches('/')
        ))
    }

    async fn prepare_request(
        &self,
        body: Bytes,
        mut headers: Headers,
        _endpoint: &str,
        ctx: &RequestContext,
    ) -> ProxyResult<PreparedRequest> {
        let access_token = self
            .auth
            .get_access_token()
            .await
            .map_err(map_auth_error)?;

        let mut payload: Value = if body.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(&body)
                .map_err(|err| ProxyError::bad_request(err.to_string()))?
        };

        if self.config.injection_mode != SystemPromptInjectionMode::None {
            if let Some(captured) = self.detection.system_prompt().await {
                payload = inject_system_prompt(payload, &captured, self.config.injection_mode);
            }
        }
        payload = limit_cache_control_blocks(&payload, MAX_CACHE_CONTROL_BLOCKS);
        payload = remove_metadata_fields(&payload);

        // Snapshot headers overwrite whatever the client sent; auth
        // material is already excluded by the overlay itself.
        for (name, value) in self.detection.overlay_headers().await {
            header_set(&mut headers, name, value);
        }
        header_set(&mut headers, "authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "content-type", "application/json");
        if header_get(&headers, "anthropic-version").is_none() {
            header_set(&mut headers, "anthropic-version", "2023-06-01");
        }
        debug!(
            event = "claude_request_prepared",
            request_id = %ctx.request_id,
            header_count = headers.len()
        );

        Ok(PreparedRequest {
            body: Bytes::from(payload.to_string()),
            headers,
        })
    }

    fn metrics_collector(&self) -> Box<dyn MetricsCollector> {
        Box::new(AnthropicMetricsCollector::new())
    }
}

pub struct ClaudePlugin {
    manifest: PluginManifest,
    config: ClaudeConfig,
    adapter: RwLock<Option<Arc<ClaudeAdapter>>>,
    detection: RwLock<Option<Arc<ClaudeDetectionService>>>,
}

impl ClaudePlugin {
    fn new(config: ClaudeConfig) -> Self {
        Self {
            manifest: manifest(),
            config,
            adapter: RwLock::new(None),
            detection: RwLock::new(None),
        }
    }
}

fn manifest() -> PluginManifest {
    let mut manifest = PluginManifest::new(PLUGIN_NAME, env!("CARGO_PKG_VERSION"));
    manifest.description = "Anthropic Claude REST upstream".to_string();
    manifest.is_provider = true;
    manifest.adapters = vec![
        ccproxy_plugin_core::AdapterSpec {
            from: Dialect::OpenAIChat,
            to: Dialect::AnthropicMessages,
        },
        ccproxy_plugin_core::AdapterSpec {
            from: Dialect::AnthropicMessages,
            to: Dialect::OpenAIChat,
        },
    ];
    manifest.routes = vec![
        ccproxy_plugin_core::RouteSpec {
            prefix: "/v1/messages".to_string(),
            format_chain: vec![Dialect::AnthropicMessages],
        },
        ccproxy_plugin_core::RouteSpec {
            prefix: "/v1/chat/completions".to_string(),
            format_chain: vec![Dialect::OpenAIChat, Dialect::AnthropicMessages],
        },
    ];
    manifest
}

#[async_trait]
impl Plugin for ClaudePlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn on_initialize(&self, _ctx: &PluginContext) -> ProxyResult<()> {
        let auth = Arc::new(ClaudeTokenManager::new(&self.config.credentials_path));
        let detection = Arc::new(ClaudeDetectionService::new(&self.config.cache_dir));
        detection.initialize().await;
        let adapter = Arc::new(ClaudeAdapter::new(
            self.config.clone(),
            auth,
            Arc::clone(&detection),
        ));
        *self.adapter.write().map_err(poisoned)? = Some(adapter);
        *self.detection.write().map_err(poisoned)? = Some(detection);
        Ok(())
    }

    fn adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        let guard = self.adapter.read().ok()?;
        guard
            .as_ref()
            .map(|adapter| Arc::clone(adapter) as Arc<dyn ProviderAdapter>)
    }

    fn health_details(&self) -> Value {
        let credentials_present = std::fs::metadata(&self.config.credentials_path).is_ok();
        let fingerprint_loaded = self
            .detection
            .read()
            .ok()
            .and_then(|guard| {
                guard
                    .as_ref()
                    .map(|detection| detection_snapshot(detection))
            })
            .unwrap_or(false);
        json!({
            "enabled": true,
            "type": "provider",
            "base_url": self.config.base_url,
            "auth_configured": credentials_present,
            "cli_detected": fingerprint_loaded,
        })
    }
}

fn detection_snapshot(detection: &Arc<ClaudeDetectionService>) -> bool {
    detection.fingerprint_loaded()
}

fn poisoned<T>(_: T) -> ProxyError {
    ProxyError::internal("claude plugin lock poisoned")
}

pub struct ClaudePluginFactory {
    config: ClaudeConfig,
}

impl ClaudePluginFactory {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }
}

impl PluginFactory for ClaudePluginFactory {
    fn manifest(&self) -> PluginManifest {
        manifest()
    }

    fn create(&self) -> Arc<dyn Plugin> {
        Arc::new(ClaudePlugin::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccproxy_auth::credentials::{ClaudeCredentials, ClaudeOauthFields};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccproxy-claude-plugin-{name}-{}", std::process::id()))
    }

    async fn adapter_with_valid_token(name: &str) -> (ClaudeAdapter, PathBuf) {
        let credentials_path = temp_path(name);
        let auth = Arc::new(ClaudeTokenManager::new(&credentials_path));
        auth.save_credentials(&ClaudeCredentials {
            oauth: ClaudeOauthFields {
                access_token: "oauth-token".into(),
                refresh_token: None,
                expires_at_ms: None,
                scopes: Vec::new(),
                subscription_type: None,
            },
        })
        .await
        .unwrap();
        let config = ClaudeConfig::new(credentials_path.clone(), std::env::temp_dir());
        let detection = Arc::new(ClaudeDetectionService::new(std::env::temp_dir()));
        (ClaudeAdapter::new(config, auth, detection), credentials_path)
    }

    #[tokio::test]
    async fn prepare_sets_bearer_and_scrubs_markers() {
        let (adapter, path) = adapter_with_valid_token("prepare").await;
        let body = json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}],
            "system": [{"type": "text", "text": "x", "_ccproxy_injected": true}]
        });
        let prepared = adapter
            .prepare_request(
                Bytes::from(body.to_string()),
                Vec::new(),
                "/v1/messages",
                &RequestContext::new("r1"),
            )
            .await
            .unwrap();

        assert_eq!(
            header_get(&prepared.headers, "authorization"),
            Some("Bearer oauth-token")
        );
        let sent: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert!(sent["system"][0].get("_ccproxy_injected").is_none());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn snapshot_headers_overwrite_client_headers_but_never_auth() {
        let (adapter, path) = adapter_with_valid_token("overlay").await;
        adapter
            .detection
            .install_fingerprint(CliFingerprint {
                cli_version: "2.1.27".into(),
                headers: vec![
                    ("user-agent".into(), "claude-cli/2.1.27 (external, cli)".into()),
                    ("authorization".into(), "Bearer captured-secret".into()),
                ],
                system: None,
            })
            .await;

        let prepared = adapter
            .prepare_request(
                Bytes::from_static(b"{}"),
                vec![("user-agent".into(), "curl/8.6.0".into())],
                "/v1/messages",
                &RequestContext::new("r1"),
            )
            .await
            .unwrap();

        // The snapshot wins over what the client sent.
        assert_eq!(
            header_get(&prepared.headers, "user-agent"),
            Some("claude-cli/2.1.27 (external, cli)")
        );
        // The captured authorization never rides along; OAuth owns it.
        assert_eq!(
            header_get(&prepared.headers, "authorization"),
            Some("Bearer oauth-token")
        );
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_credentials_surface_as_auth_error() {
        let config = ClaudeConfig::new(temp_path("no-creds"), std::env::temp_dir());
        let auth = Arc::new(ClaudeTokenManager::new(&config.credentials_path));
        let detection = Arc::new(ClaudeDetectionService::new(std::env::temp_dir()));
        let adapter = ClaudeAdapter::new(config, auth, detection);
        let err = adapter
            .prepare_request(
                Bytes::from_static(b"{}"),
                Vec::new(),
                "/v1/messages",
                &RequestContext::new("r1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn manifest_declares_both_adapter_directions() {
        let manifest = manifest();
        assert!(manifest.is_provider);
        assert_eq!(manifest.adapters.len(), 2);
        assert_eq!(manifest.routes.len(), 2);
    }
}
