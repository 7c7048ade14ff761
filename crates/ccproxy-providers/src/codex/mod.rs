//! Codex provider plugin. The ChatGPT backend only speaks streaming, so
//! every outgoing request is forced to `stream: true`; non-streaming
//! clients are served through the pipeline's buffering pathway.

mod detection;
mod metrics;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use ccproxy_auth::{CodexTokenManager, TokenManager};
use ccproxy_common::{Headers, ProxyError, ProxyResult, header_get, header_set};
use ccproxy_plugin_core::{
    MetricsCollector, Plugin, PluginContext, PluginFactory, PluginManifest, PreparedRequest,
    ProviderAdapter, RequestContext,
};
use ccproxy_protocol::Dialect;

use crate::map_auth_error;

pub use detection::CodexDetectionService;
pub use metrics::OpenAIMetricsCollector;

const PLUGIN_NAME: &str = "codex";
const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
/// Parameters the Codex upstream rejects outright.
const UNSUPPORTED_FIELDS: &[&str] = &["max_output_tokens", "max_completion_tokens"];

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub base_url: String,
    pub credentials_path: PathBuf,
    pub cache_dir: PathBuf,
}

impl CodexConfig {
    pub fn new(credentials_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials_path,
            cache_dir,
        }
    }
}

pub struct CodexAdapter {
    config: CodexConfig,
    auth: Arc<CodexTokenManager>,
    detection: Arc<CodexDetectionService>,
}

impl CodexAdapter {
    pub fn new(
        config: CodexConfig,
        auth: Arc<CodexTokenManager>,
        detection: Arc<CodexDetectionService>,
    ) -> Self {
        Self {
            config,
            auth,
            detection,
        }
    }

    /// Everything the upstream contract demands of an outgoing payload:
    /// always streaming, never stored, unsupported limits stripped, the
    /// instruction prelude prepended.
    fn shape_payload(&self, mut payload: Value) -> Value {
        let Some(obj) = payload.as_object_mut() else {
            return payload;
        };
        obj.insert("stream".to_string(), Value::Bool(true));
        obj.insert("store".to_string(), Value::Bool(false));
        for field in UNSUPPORTED_FIELDS {
            obj.remove(*field);
        }

        let prelude = self.detection.instructions();
        let instructions = match obj.get("instructions").and_then(Value::as_str) {
            Some(existing) if !existing.is_empty() => format!("{prelude}\n{existing}"),
            _ => prelude,
        };
        obj.insert("instructions".to_string(), Value::String(instructions));
        payload
    }
}

#[async_trait]
impl ProviderAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn stream_only(&self) -> bool {
        true
    }

    async fn target_url(&self, _endpoint: &str) -> ProxyResult<String> {
        Ok(format!(
            "{}/responses",
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

        let payload: Value = if body.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(&body)
                .map_err(|err| ProxyError::bad_request(err.to_string()))?
        };
        let payload = self.shape_payload(payload);

        // Session identity headers: generated when the client sent none.
        if header_get(&headers, "session_id").is_none() {
            header_set(&mut headers, "session_id", Uuid::new_v4().to_string());
        }
        if header_get(&headers, "conversation_id").is_none() {
            header_set(&mut headers, "conversation_id", Uuid::new_v4().to_string());
        }
        if let Some(account_id) = self.auth.profile().await.and_then(|p| p.account_id) {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        header_set(&mut headers, "authorization", format!("Bearer {access_token}"));
        header_set(&mut headers, "content-type", "application/json");
        header_set(&mut headers, "accept", "text/event-stream");
        debug!(event = "codex_request_prepared", request_id = %ctx.request_id);

        Ok(PreparedRequest {
            body: Bytes::from(payload.to_string()),
            headers,
        })
    }

    fn metrics_collector(&self) -> Box<dyn MetricsCollector> {
        Box::new(OpenAIMetricsCollector::new())
    }
}

pub struct CodexPlugin {
    manifest: PluginManifest,
    config: CodexConfig,
    adapter: RwLock<Option<Arc<CodexAdapter>>>,
    detection: RwLock<Option<Arc<CodexDetectionService>>>,
}

impl CodexPlugin {
    fn new(config: CodexConfig) -> Self {
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
    manifest.description = "OpenAI Codex / ChatGPT backend upstream".to_string();
    manifest.is_provider = true;
    manifest.routes = vec![
        ccproxy_plugin_core::RouteSpec {
            prefix: "/v1/responses".to_string(),
            format_chain: vec![Dialect::OpenAIResponses],
        },
        ccproxy_plugin_core::RouteSpec {
            prefix: "/codex/responses".to_string(),
            format_chain: vec![Dialect::OpenAIResponses],
        },
    ];
    manifest
}

#[async_trait]
impl Plugin for CodexPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn on_initialize(&self, _ctx: &PluginContext) -> ProxyResult<()> {
        let auth = Arc::new(CodexTokenManager::new(&self.config.credentials_path));
        let detection = Arc::new(CodexDetectionService::new(&self.config.cache_dir));
        detection.initialize().await;
        let adapter = Arc::new(CodexAdapter::new(
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
        let builtin_instructions = self
            .detection
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|d| d.using_builtin()))
            .unwrap_or(true);
        json!({
            "enabled": true,
            "type": "provider",
            "base_url": self.config.base_url,
            "auth_configured": credentials_present,
            "builtin_instructions": builtin_instructions,
        })
    }
}

fn poisoned<T>(_: T) -> ProxyError {
    ProxyError::internal("codex plugin lock poisoned")
}

pub struct CodexPluginFactory {
    config: CodexConfig,
}

impl CodexPluginFactory {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }
}

impl PluginFactory for CodexPluginFactory {
    fn manifest(&self) -> PluginManifest {
        manifest()
    }

    fn create(&self) -> Arc<dyn Plugin> {
        Arc::new(CodexPlugin::new(self.config.clone()))
    }
}
