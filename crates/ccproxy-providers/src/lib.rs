//! Built-in provider plugins: Claude, Codex and Copilot.
//!
//! Each module holds the provider's plugin, its request-shaping adapter,
//! its CLI detection cache, and its streaming metrics collector.

pub mod claude;
pub mod codex;
pub mod copilot;
pub mod pricing;

use ccproxy_auth::AuthError;
use ccproxy_common::ProxyError;
use ccproxy_plugin_core::PluginFactory;

/// Auth failures surface with the wire semantics of §7: missing credentials
/// are a 401 authentication_error, and so is an expired chain that cannot
/// refresh.
pub(crate) fn map_auth_error(err: AuthError) -> ProxyError {
    match err {
        AuthError::MissingCredentials(provider) => {
            ProxyError::AuthMissing(format!("no credentials stored for {provider}"))
        }
        AuthError::ReauthRequired(provider) => {
            ProxyError::AuthExpired(format!("{provider} re-authentication required"))
        }
        other => ProxyError::AuthExpired(other.to_string()),
    }
}

pub use claude::{ClaudeConfig, ClaudePlugin, SystemPromptInjectionMode};
pub use codex::{CodexConfig, CodexPlugin};
pub use copilot::{CopilotConfig, CopilotPlugin};
pub use pricing::StaticPricing;

/// The factories the application registers at startup.
pub fn builtin_plugin_factories(
    claude: ClaudeConfig,
    codex: CodexConfig,
    copilot: CopilotConfig,
) -> Vec<Box<dyn PluginFactory>> {
    vec![
        Box::new(claude::ClaudePluginFactory::new(claude)),
        Box::new(codex::CodexPluginFactory::new(codex)),
        Box::new(copilot::CopilotPluginFactory::new(copilot)),
    ]
}
