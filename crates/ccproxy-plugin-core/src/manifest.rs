use ccproxy_protocol::Dialect;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static description of a plugin. Names are unique across the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub is_provider: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
    /// Plugins that must be initialized before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Soft dependencies; initialization order honors them when present but
    /// their absence is not an error.
    #[serde(default)]
    pub optional_requires: Vec<String>,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

impl PluginManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            is_provider: false,
            config_schema: None,
            dependencies: Vec::new(),
            optional_requires: Vec::new(),
            adapters: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// A format-adapter direction this plugin declares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub from: Dialect,
    pub to: Dialect,
}

/// A route prefix this plugin serves, and the format chain applied on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub prefix: String,
    pub format_chain: Vec<Dialect>,
}
