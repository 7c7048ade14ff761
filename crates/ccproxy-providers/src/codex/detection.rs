//! Instruction capture for the Codex upstream.
//!
//! The ChatGPT backend rejects requests without the CLI's instruction
//! prelude. The detection service reads the instructions the installed CLI
//! ships, caches them keyed by CLI version, and falls back to a built-in
//! copy when no CLI is present.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Built-in fallback when no CLI is installed to capture from.
const DEFAULT_INSTRUCTIONS: &str = "You are Codex, based on GPT-5. You are running as a coding \
agent in the Codex CLI on a user's computer.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedInstructions {
    cli_version: String,
    instructions: String,
}

pub struct CodexDetectionService {
    cache_dir: PathBuf,
    cli_binary: String,
    instructions: RwLock<String>,
}

impl CodexDetectionService {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            cli_binary: "codex".to_string(),
            instructions: RwLock::new(DEFAULT_INSTRUCTIONS.to_string()),
        }
    }

    /// The mandatory instruction prelude.
    pub fn instructions(&self) -> String {
        self.instructions
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| DEFAULT_INSTRUCTIONS.to_string())
    }

    pub fn using_builtin(&self) -> bool {
        self.instructions
            .read()
            .map(|guard| *guard == DEFAULT_INSTRUCTIONS)
            .unwrap_or(true)
    }

    pub async fn initialize(&self) {
        let Some(version) = self.cli_version().await else {
            info!(event = "codex_cli_not_found", binary = %self.cli_binary);
            return;
        };
        if let Some(cached) = self.load_cached(&version).await {
            debug!(event = "codex_instructions_cache_hit", version = %version);
            if let Ok(mut guard) = self.instructions.write() {
                *guard = cached.instructions;
            }
            return;
        }
        if let Some(instructions) = self.capture(&version).await {
            self.store_cached(&version, &instructions).await;
            info!(event = "codex_instructions_captured", version = %version);
            if let Ok(mut guard) = self.instructions.write() {
                *guard = instructions;
            }
        }
    }

    async fn cli_version(&self) -> Option<String> {
        let output = tokio::process::Command::new(&self.cli_binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        let version = raw.split_whitespace().last()?.trim().to_string();
        if version.is_empty() { None } else { Some(version) }
    }

    /// The CLI prints its active instruction prelude under debug output;
    /// any failure keeps the built-in copy.
    async fn capture(&self, _version: &str) -> Option<String> {
        let output = tokio::process::Command::new(&self.cli_binary)
            .args(["debug", "instructions"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }

    fn cache_path(&self, version: &str) -> PathBuf {
        self.cache_dir.join(format!("codex-instructions-{version}.json"))
    }

    async fn load_cached(&self, version: &str) -> Option<CachedInstructions> {
        let raw = tokio::fs::read(self.cache_path(version)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn store_cached(&self, version: &str, instructions: &str) {
        if tokio::fs::create_dir_all(&self.cache_dir).await.is_err() {
            return;
        }
        let cached = CachedInstructions {
            cli_version: version.to_string(),
            instructions: instructions.to_string(),
        };
        let raw = serde_json::to_vec_pretty(&cached).unwrap_or_default();
        let _ = tokio::fs::write(self.cache_path(version), raw).await;
    }
}
