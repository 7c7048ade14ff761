//! OAuth credential management for the upstream providers.
//!
//! Each provider gets a token manager with the same contract: lazy
//! refresh-on-use, at most one in-flight refresh (concurrent callers share
//! the outcome), atomic credential persistence, and profile derivation.

pub mod claude;
pub mod codex;
pub mod copilot;
pub mod credentials;
pub mod device;
pub mod error;
pub mod jwt;
pub mod manager;
pub mod storage;

pub use claude::ClaudeTokenManager;
pub use codex::CodexTokenManager;
pub use copilot::CopilotTokenManager;
pub use credentials::{
    ClaudeCredentials, CodexCredentials, CopilotCredentials, StandardProfile, TokenSnapshot,
};
pub use error::{AuthError, AuthResult};
pub use manager::TokenManager;
pub use storage::CredentialStore;

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn now_unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
