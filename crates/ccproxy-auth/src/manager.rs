use std::sync::OnceLock;

use async_trait::async_trait;

use crate::credentials::{StandardProfile, TokenSnapshot};
use crate::error::AuthResult;

/// Uniform token-manager contract shared by every provider.
///
/// `get_access_token` is refresh-on-use: a valid token is returned as-is, an
/// expired-but-refreshable credential triggers exactly one refresh shared by
/// all concurrent callers, and a non-refreshable credential is returned
/// unchanged so the upstream gets to reject it.
#[async_trait]
pub trait TokenManager: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn get_access_token(&self) -> AuthResult<String>;

    /// Stricter sibling: `None` on any refresh failure.
    async fn get_access_token_with_refresh(&self) -> Option<String>;

    /// Read-only diagnostic projection of the stored credentials.
    async fn snapshot(&self) -> Option<TokenSnapshot>;

    /// Profile derived from the token itself or a provider API, with a
    /// process-lifetime cache that refresh invalidates.
    async fn profile(&self) -> Option<StandardProfile>;

    /// Cache-only variant; never performs network IO.
    async fn profile_quick(&self) -> Option<StandardProfile>;
}

static SHARED_CLIENT: OnceLock<wreq::Client> = OnceLock::new();

/// One process-wide client for identity-provider calls. Token endpoints are
/// low-volume; they do not need the request pipeline's pool.
pub(crate) fn oauth_http_client() -> &'static wreq::Client {
    SHARED_CLIENT.get_or_init(wreq::Client::new)
}
