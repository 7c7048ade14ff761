mod config;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ccproxy_core::{
    ConnectionPool, HttpPipeline, ModelFetcher, ModelRegistry, PoolConfig, StreamingHandler,
    TokenCounter, WreqUpstreamClient,
};
use ccproxy_format::builtin_registry;
use ccproxy_plugin_core::{HookBus, PluginContext, PluginRegistry, PricingService};
use ccproxy_providers::{
    ClaudeConfig, CodexConfig, CopilotConfig, StaticPricing, builtin_plugin_factories,
};
use ccproxy_server::{AppState, ValidationSettings, build_router};

use config::Settings;

#[derive(Debug, Parser)]
#[command(name = "ccproxy", about = "Reverse proxy for LLM chat traffic")]
struct Cli {
    #[arg(long, env = "CCPROXY_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "CCPROXY_PORT", default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("ccproxy=info,ccproxy_core=info,ccproxy_providers=info")
        }))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    info!(
        event = "starting",
        host = %cli.host,
        port = cli.port,
        pool_size = settings.pool_size
    );
    if settings.disable_local_plugin_discovery {
        info!(event = "local_plugin_discovery_disabled");
    }

    // Shared services, leaves first.
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        default_timeout: settings.http_timeout,
        streaming_timeout: settings.stream_timeout,
        pool_size: settings.pool_size,
        proxy: None,
        verify: true,
    }));
    let client = Arc::new(WreqUpstreamClient::new(Arc::clone(&pool)));
    let hooks = HookBus::default();
    let pricing: Arc<dyn PricingService> = Arc::new(StaticPricing::new());
    let streaming = Arc::new(StreamingHandler::new(hooks.clone(), Some(pricing)));
    let formats = Arc::new(builtin_registry());
    let pipeline = Arc::new(HttpPipeline::new(client, formats, streaming, hooks.clone()));

    let models = Arc::new(ModelRegistry::new(ModelFetcher::new(
        settings.model_cache_dir.clone(),
    )));
    models.initialize().await;
    let counter = Arc::new(TokenCounter::new());

    // Provider plugins.
    let mut claude_config = ClaudeConfig::new(
        settings.credentials_path("claude"),
        settings.model_cache_dir.clone(),
    );
    if let Some(base_url) = settings.claude_base_url.clone() {
        claude_config.base_url = base_url;
    }
    let mut codex_config = CodexConfig::new(
        settings.credentials_path("codex"),
        settings.model_cache_dir.clone(),
    );
    if let Some(base_url) = settings.codex_base_url.clone() {
        codex_config.base_url = base_url;
    }
    let mut copilot_config = CopilotConfig::new(settings.credentials_path("copilot"));
    if let Some(base_url) = settings.copilot_base_url.clone() {
        copilot_config.base_url = base_url;
    }

    let context = PluginContext::new();
    context.insert(Arc::clone(&pool));
    context.insert(Arc::clone(&models));
    context.insert(Arc::clone(&counter));
    context.insert(Arc::new(hooks.clone()));

    let mut registry = PluginRegistry::new();
    for factory in builtin_plugin_factories(claude_config, codex_config, copilot_config) {
        registry.register(factory)?;
    }
    registry.initialize_all(&context).await?;

    let mut adapters = HashMap::new();
    for name in registry.plugin_names() {
        if let Some(adapter) = registry.get_adapter(&name) {
            adapters.insert(name, adapter);
        }
    }
    let registry = Arc::new(tokio::sync::Mutex::new(registry));

    let state = AppState::new(
        pipeline,
        adapters,
        Arc::clone(&registry),
        models,
        counter,
        ValidationSettings::default(),
    );
    let router = build_router(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(event = "listening", addr = %addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(event = "shutting_down");
    registry.lock().await.shutdown_all().await;
    pool.close_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "shutdown_signal_failed", error = %err);
    }
}
