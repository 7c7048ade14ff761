//! Copilot provider plugin: two-stage GitHub auth, editor header
//! fingerprint, and response normalization with a raw-body fallback.

mod normalize;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use ccproxy_auth::CopilotTokenManager;
use ccproxy_common::{Headers, ProxyError, ProxyResult, header_set};
use ccproxy_plugin_core::{
    MetricsCollector, Plugin, PluginContext, PluginFactory, PluginManifest, PreparedRequest,
    ProviderAdapter, RequestContext,
};
use ccproxy_protocol::Dialect;

use crate::codex::OpenAIMetricsCollector;
use crate::map_auth_error;

pub use normalize::{normalize_response_payload, patch_created_timestamp};

const PLUGIN_NAME: &str = "copilot";
const DEFAULT_BASE_URL: &str = "https://api.githubcopilot.com";

#[derive(Debug, Clone)]
pub struct CopilotConfig {
    pub base_url: String,
    pub credentials_path: PathBuf,
    /// Editor/plugin identity headers sent with every request.
    pub api_headers: Vec<(String, String)>,
}

impl CopilotConfig {
    pub fn new(credentials_path: PathBuf) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials_path,
            api_headers: vec![
                ("editor-version".to_string(), "vscode/1.99.0".to_string()),
                (
                    "editor-plugin-version".to_string(),
                    "copilot-chat/0.26.0".to_string(),
                ),
                ("copilot-integration-id".to_string(), "vscode-chat".to_string()),
            ],
        }
    }
}

pub struct CopilotAdapter {
    config: CopilotConfig,
    auth: Arc<CopilotTokenManager>,
}

impl CopilotAdapter {
    pub fn new(config: CopilotConfig, auth: Arc<CopilotTokenManager>) -> Self {
        Self { config, auth }
    }
}

#[async_trait]
impl ProviderAdapter for CopilotAdapter {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn target_url(&self, endpoint: &str) -> ProxyResult<String> {
        // The route prefix (`/copilot`) is proxy-local; the upstream path
        // starts at the API surface.
        let path = endpoint.strip_prefix("/copilot").unwrap_or(endpoint);
        Ok(format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }

    async fn prepare_request(
        &self,
        body: Bytes,
        mut headers: Headers,
        _endpoint: &str,
        ctx: &RequestContext,
    ) -> ProxyResult<PreparedRequest> {
        let service_token = self
            .auth
            .ensure_copilot_token()
            .await
            .map_err(map_auth_error)?;

        for (name, value) in &self.config.api_headers {
            header_set(&mut headers, name.to_ascii_lowercase(), value.clone());
        }
        header_set(&mut headers, "authorization", format!("Bearer {service_token}"));
        header_set(&mut headers, "x-request-id", Uuid::new_v4().to_string());
        header_set(&mut headers, "content-type", "application/json");
        debug!(event = "copilot_request_prepared", request_id = %ctx.request_id);

        Ok(PreparedRequest { body, headers })
    }

    fn process_response(&self, endpoint: &str, status: u16, body: Bytes) -> ProxyResult<Bytes> {
        if status >= 400 {
            return Ok(body);
        }
        let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        let now = now_epoch();

        if endpoint.ends_with("/chat/completions") {
            if let Some(patched) = patch_created_timestamp(&payload, now) {
                return Ok(Bytes::from(patched.to_string()));
            }
            return Ok(body);
        }
        if endpoint.ends_with("/responses") {
            // Normalization failure falls back to the raw body so partially
            // valid provider responses still reach clients.
            if let Some(normalized) = normalize_response_payload(&payload, now) {
                return Ok(Bytes::from(normalized.to_string()));
            }
            return Ok(body);
        }
        Ok(body)
    }

    fn metrics_collector(&self) -> Box<dyn MetricsCollector> {
        Box::new(OpenAIMetricsCollector::new())
    }
}

fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct CopilotPlugin {
    manifest: PluginManifest,
    config: CopilotConfig,
    adapter: RwLock<Option<Arc<CopilotAdapter>>>,
}

impl CopilotPlugin {
    fn new(config: CopilotConfig) -> Self {
        Self {
            manifest: manifest(),
            config,
            adapter: RwLock::new(None),
        }
    }
}

fn manifest() -> PluginManifest {
    let mut manifest = PluginManifest::new(PLUGIN_NAME, env!("CARGO_PKG_VERSION"));
    manifest.description = "GitHub Copilot upstream".to_string();
    manifest.is_provider = true;
    manifest.routes = vec![ccproxy_plugin_core::RouteSpec {
        prefix: "/copilot/chat/completions".to_string(),
        format_chain: vec![Dialect::OpenAIChat],
    }];
    manifest
}

#[async_trait]
impl Plugin for CopilotPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn on_initialize(&self, _ctx: &PluginContext) -> ProxyResult<()> {
        let auth = Arc::new(CopilotTokenManager::new(&self.config.credentials_path));
        let adapter = Arc::new(CopilotAdapter::new(self.config.clone(), auth));
        *self
            .adapter
            .write()
            .map_err(|_| ProxyError::internal("copilot plugin lock poisoned"))? = Some(adapter);
        Ok(())
    }

    fn adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        let guard = self.adapter.read().ok()?;
        guard
            .as_ref()
            .map(|adapter| Arc::clone(adapter) as Arc<dyn ProviderAdapter>)
    }

    fn health_details(&self) -> Value {
        json!({
            "enabled": true,
            "type": "provider",
            "base_url": self.config.base_url,
            "auth_configured": std::fs::metadata(&self.config.credentials_path).is_ok(),
        })
    }
}

pub struct CopilotPluginFactory {
    config: CopilotConfig,
}

impl CopilotPluginFactory {
    pub fn new(config: CopilotConfig) -> Self {
        Self { config }
    }
}

impl PluginFactory for CopilotPluginFactory {
    fn manifest(&self) -> PluginManifest {
        manifest()
    }

    fn create(&self) -> Arc<dyn Plugin> {
        Arc::new(CopilotPlugin::new(self.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccproxy_auth::credentials::{
        CopilotCredentials, CopilotOauthToken, CopilotServiceToken,
    };

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ccproxy-copilot-plugin-{name}-{}.json",
            std::process::id()
        ))
    }

    async fn adapter_with_valid_tokens(name: &str) -> (CopilotAdapter, PathBuf) {
        let path = temp_path(name);
        let auth = Arc::new(CopilotTokenManager::new(&path));
        auth.save_credentials(&CopilotCredentials {
            oauth_token: CopilotOauthToken {
                access_token: "gho_token".into(),
                token_type: Some("bearer".into()),
                scope: None,
                created_at: 0,
                expires_in: None,
            },
            copilot_token: Some(CopilotServiceToken {
                token: "svc_token".into(),
                expires_at: i64::MAX,
            }),
            account_type: None,
            created_at: 0,
            updated_at: 0,
        })
        .await
        .unwrap();
        let config = CopilotConfig::new(path.clone());
        (CopilotAdapter::new(config, auth), path)
    }

    #[tokio::test]
    async fn prepare_injects_editor_headers_and_fresh_request_id() {
        let (adapter, path) = adapter_with_valid_tokens("prepare").await;
        let prepared = adapter
            .prepare_request(
                Bytes::from_static(b"{}"),
                Vec::new(),
                "/copilot/chat/completions",
                &RequestContext::new("r1"),
            )
            .await
            .unwrap();
        assert_eq!(
            ccproxy_common::header_get(&prepared.headers, "authorization"),
            Some("Bearer svc_token")
        );
        assert_eq!(
            ccproxy_common::header_get(&prepared.headers, "editor-version"),
            Some("vscode/1.99.0")
        );
        assert!(ccproxy_common::header_get(&prepared.headers, "x-request-id").is_some());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn target_url_strips_the_route_prefix() {
        let (adapter, path) = adapter_with_valid_tokens("url").await;
        assert_eq!(
            adapter.target_url("/copilot/chat/completions").await.unwrap(),
            "https://api.githubcopilot.com/chat/completions"
        );
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn chat_completion_without_created_is_patched() {
        let (adapter, path) = adapter_with_valid_tokens("created").await;
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "x"}}]
        });
        let out = adapter
            .process_response(
                "/copilot/chat/completions",
                200,
                Bytes::from(body.to_string()),
            )
            .unwrap();
        let out: Value = serde_json::from_slice(&out).unwrap();
        assert!(out["created"].as_i64().unwrap() > 0);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unnormalizable_responses_body_passes_through() {
        let (adapter, path) = adapter_with_valid_tokens("fallback").await;
        let raw = Bytes::from_static(b"{\"output\": \"garbage\", \"model\": null}");
        let out = adapter
            .process_response("/copilot/responses", 200, raw.clone())
            .unwrap();
        assert_eq!(out, raw);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn error_bodies_are_never_rewritten() {
        let (adapter, path) = adapter_with_valid_tokens("error").await;
        let raw = Bytes::from_static(b"{\"error\": {\"message\": \"nope\"}}");
        let out = adapter
            .process_response("/copilot/chat/completions", 400, raw.clone())
            .unwrap();
        assert_eq!(out, raw);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
