use std::sync::Arc;

use async_trait::async_trait;
use ccproxy_common::ProxyResult;
use serde_json::Value;

use crate::context::PluginContext;
use crate::manifest::PluginManifest;
use crate::provider::ProviderAdapter;

/// Lifecycle of one plugin runtime. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Created,
    Initializing,
    Initialized,
    ShuttingDown,
    Shutdown,
}

/// A constructed plugin. `on_initialize` may assume every dependency named
/// in the manifest is already initialized; it must never assume anything
/// about plugins that depend on it.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    async fn on_initialize(&self, ctx: &PluginContext) -> ProxyResult<()>;

    async fn on_shutdown(&self) -> ProxyResult<()> {
        Ok(())
    }

    /// The provider adapter this plugin exposes, for provider plugins.
    fn adapter(&self) -> Option<Arc<dyn ProviderAdapter>> {
        None
    }

    /// Synchronous health snapshot. Always includes `initialized`,
    /// `enabled` and `type`; providers add auth/detection extras.
    fn health_details(&self) -> Value;
}

/// Builds plugin instances for the registry.
pub trait PluginFactory: Send + Sync {
    fn manifest(&self) -> PluginManifest;
    fn create(&self) -> Arc<dyn Plugin>;
}
