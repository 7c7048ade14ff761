use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ccproxy_common::{ProxyError, ProxyResult};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::context::PluginContext;
use crate::manifest::PluginManifest;
use crate::plugin::{Plugin, PluginFactory, PluginState};
use crate::provider::ProviderAdapter;

struct Runtime {
    plugin: Arc<dyn Plugin>,
    state: PluginState,
}

/// Owns every plugin runtime. Construction and initialization follow the
/// dependency order of the manifests; shutdown walks it in reverse.
#[derive(Default)]
pub struct PluginRegistry {
    factories: Vec<Box<dyn PluginFactory>>,
    runtimes: HashMap<String, Runtime>,
    /// Topological order used at initialize time; reversed for shutdown.
    order: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate manifest names fail.
    pub fn register(&mut self, factory: Box<dyn PluginFactory>) -> ProxyResult<()> {
        let name = factory.manifest().name;
        if self.factories.iter().any(|f| f.manifest().name == name) {
            return Err(ProxyError::internal(format!(
                "duplicate plugin registration: {name}"
            )));
        }
        self.factories.push(factory);
        Ok(())
    }

    /// Construct and initialize every registered plugin in dependency
    /// order. A failure aborts the remainder and unwinds plugins already
    /// initialized, in reverse order.
    pub async fn initialize_all(&mut self, ctx: &PluginContext) -> ProxyResult<()> {
        let manifests: Vec<PluginManifest> =
            self.factories.iter().map(|f| f.manifest()).collect();
        let order = topological_order(&manifests)?;

        let mut initialized: Vec<String> = Vec::new();
        for name in &order {
            let factory = self
                .factories
                .iter()
                .find(|f| &f.manifest().name == name)
                .ok_or_else(|| ProxyError::internal(format!("missing factory for {name}")))?;
            let plugin = factory.create();
            self.runtimes.insert(
                name.clone(),
                Runtime {
                    plugin: Arc::clone(&plugin),
                    state: PluginState::Initializing,
                },
            );
            debug!(event = "plugin_initializing", plugin = %name);

            if let Err(err) = plugin.on_initialize(ctx).await {
                error!(event = "plugin_initialize_failed", plugin = %name, error = %err);
                self.unwind(&initialized).await;
                return Err(err);
            }

            if let Some(runtime) = self.runtimes.get_mut(name) {
                runtime.state = PluginState::Initialized;
            }
            initialized.push(name.clone());
            info!(event = "plugin_initialized", plugin = %name);
        }

        self.order = order;
        Ok(())
    }

    async fn unwind(&mut self, initialized: &[String]) {
        for name in initialized.iter().rev() {
            if let Some(runtime) = self.runtimes.get_mut(name) {
                runtime.state = PluginState::ShuttingDown;
                if let Err(err) = runtime.plugin.on_shutdown().await {
                    error!(event = "plugin_unwind_failed", plugin = %name, error = %err);
                }
                runtime.state = PluginState::Shutdown;
            }
        }
        self.runtimes.clear();
    }

    /// Reverse topological order, best effort: shutdown errors are logged,
    /// never propagated.
    pub async fn shutdown_all(&mut self) {
        let order: Vec<String> = self.order.iter().rev().cloned().collect();
        for name in order {
            if let Some(runtime) = self.runtimes.get_mut(&name) {
                runtime.state = PluginState::ShuttingDown;
                if let Err(err) = runtime.plugin.on_shutdown().await {
                    error!(event = "plugin_shutdown_failed", plugin = %name, error = %err);
                }
                runtime.state = PluginState::Shutdown;
                info!(event = "plugin_shutdown", plugin = %name);
            }
        }
    }

    /// Typed adapter lookup; only initialized plugins are visible.
    pub fn get_adapter(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let runtime = self.runtimes.get(name)?;
        if runtime.state != PluginState::Initialized {
            return None;
        }
        runtime.plugin.adapter()
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.runtimes.get(name).map(|r| r.state)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Health snapshot of every runtime.
    pub fn health(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, runtime) in &self.runtimes {
            let mut details = runtime.plugin.health_details();
            if let Some(obj) = details.as_object_mut() {
                obj.insert(
                    "initialized".to_string(),
                    Value::Bool(runtime.state == PluginState::Initialized),
                );
            }
            out.insert(name.clone(), details);
        }
        Value::Object(out)
    }
}

/// Kahn's algorithm over the manifest dependency edges. Registration order
/// breaks ties so initialization is deterministic. Unknown hard
/// dependencies and cycles are typed errors; optional requirements only
/// order plugins that are actually present.
fn topological_order(manifests: &[PluginManifest]) -> ProxyResult<Vec<String>> {
    let known: HashSet<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

    for manifest in manifests {
        in_degree.entry(manifest.name.as_str()).or_insert(0);
        for dep in &manifest.dependencies {
            if !known.contains(dep.as_str()) {
                return Err(ProxyError::internal(format!(
                    "plugin {} depends on unknown plugin {dep}",
                    manifest.name
                )));
            }
            edges
                .entry(dep.as_str())
                .or_default()
                .push(manifest.name.as_str());
            *in_degree.entry(manifest.name.as_str()).or_insert(0) += 1;
        }
        for dep in &manifest.optional_requires {
            if known.contains(dep.as_str()) {
                edges
                    .entry(dep.as_str())
                    .or_default()
                    .push(manifest.name.as_str());
                *in_degree.entry(manifest.name.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut ready: Vec<&str> = manifests
        .iter()
        .map(|m| m.name.as_str())
        .filter(|name| in_degree[name] == 0)
        .collect();
    let mut out = Vec::new();

    while let Some(name) = ready.first().copied() {
        ready.remove(0);
        out.push(name.to_string());
        if let Some(next) = edges.get(name) {
            for dependent in next {
                let degree = in_degree
                    .get_mut(dependent)
                    .ok_or_else(|| ProxyError::internal("degree bookkeeping broken"))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    if out.len() != manifests.len() {
        return Err(ProxyError::internal(
            "plugin dependency cycle detected".to_string(),
        ));
    }
    Ok(out)
}
