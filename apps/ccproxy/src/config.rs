use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POOL_SIZE: usize = 10;

/// Runtime settings, environment first, compiled defaults second.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_timeout: Duration,
    pub stream_timeout: Duration,
    pub pool_size: usize,
    pub disable_local_plugin_discovery: bool,
    pub model_cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub claude_base_url: Option<String>,
    pub codex_base_url: Option<String>,
    pub copilot_base_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            http_timeout: Duration::from_secs(
                env_parse("CCPROXY_HTTP_TIMEOUT").unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
            stream_timeout: Duration::from_secs(
                env_parse("CCPROXY_STREAM_TIMEOUT").unwrap_or(DEFAULT_STREAM_TIMEOUT_SECS),
            ),
            pool_size: env_parse("CCPROXY_POOL_SIZE").unwrap_or(DEFAULT_POOL_SIZE),
            disable_local_plugin_discovery: env_flag("CCPROXY_PLUGINS_DISABLE_LOCAL_DISCOVERY"),
            model_cache_dir: std::env::var_os("CCPROXY_MODEL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_cache_dir),
            config_dir: default_config_dir(),
            claude_base_url: env_string("CCPROXY_CLAUDE_BASE_URL"),
            codex_base_url: env_string("CCPROXY_CODEX_BASE_URL"),
            copilot_base_url: env_string("CCPROXY_COPILOT_BASE_URL"),
        }
    }

    pub fn credentials_path(&self, provider: &str) -> PathBuf {
        self.config_dir.join(format!("{provider}.json"))
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name)?.trim().parse().ok()
}

fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ccproxy")
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ccproxy")
}
