use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credentials::{ClaudeCredentials, ClaudeOauthFields, StandardProfile, TokenSnapshot};
use crate::device::{DeviceAuthorization, PollBackoff, PollOutcome};
use crate::error::{AuthError, AuthResult};
use crate::manager::{TokenManager, oauth_http_client};
use crate::storage::CredentialStore;
use crate::{now_unix, now_unix_ms};

const DEFAULT_CONSOLE_BASE_URL: &str = "https://console.anthropic.com";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_SCOPE: &str = "user:profile user:inference";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, alias = "subscriptionType")]
    subscription_type: Option<String>,
}

/// PKCE pair for the authorization-code variant of the login flow.
#[derive(Debug)]
pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

pub fn generate_pkce() -> PkceCodes {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = Sha256::digest(code_verifier.as_bytes());
    let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    PkceCodes {
        code_verifier,
        code_challenge,
    }
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub struct ClaudeTokenManager {
    store: Arc<CredentialStore<ClaudeCredentials>>,
    console_base_url: String,
    refresh_gate: Mutex<()>,
    profile_cache: Mutex<Option<StandardProfile>>,
}

impl ClaudeTokenManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_base_url(path, DEFAULT_CONSOLE_BASE_URL)
    }

    pub fn with_base_url(path: impl Into<PathBuf>, console_base_url: impl Into<String>) -> Self {
        Self {
            store: Arc::new(CredentialStore::new(path)),
            console_base_url: console_base_url.into().trim_end_matches('/').to_string(),
            refresh_gate: Mutex::new(()),
            profile_cache: Mutex::new(None),
        }
    }

    pub async fn load_credentials(&self) -> AuthResult<Option<ClaudeCredentials>> {
        self.store.load().await
    }

    pub async fn save_credentials(&self, credentials: &ClaudeCredentials) -> AuthResult<()> {
        self.store.save(credentials).await
    }

    pub fn is_expired(&self, credentials: &ClaudeCredentials) -> bool {
        match credentials.oauth.expires_at_ms {
            Some(expires_at_ms) => now_unix_ms() >= expires_at_ms,
            None => false,
        }
    }

    /// Refresh via the console token endpoint. Returns the new credentials
    /// or `None` when the refresh endpoint rejects us; the caller decides
    /// whether that is fatal.
    pub async fn refresh_token(&self) -> Option<ClaudeCredentials> {
        let _gate = self.refresh_gate.lock().await;
        let current = self.store.load().await.ok()??;
        if !self.is_expired(&current) {
            // Another caller finished the refresh while we waited.
            return Some(current);
        }
        let refresh_token = current.oauth.refresh_token.clone()?;

        // The refresh must survive caller cancellation so every waiter on
        // the gate still benefits; run it as a detached task.
        let store = Arc::clone(&self.store);
        let url = format!("{}/v1/oauth/token", self.console_base_url);
        let handle = tokio::spawn(async move {
            let tokens = request_refresh(&url, &refresh_token).await?;
            let credentials = apply_token_response(current, tokens);
            store
                .save(&credentials)
                .await
                .map(|_| credentials)
                .map_err(|err| AuthError::Storage(err.to_string()))
        });
        match handle.await {
            Ok(Ok(credentials)) => {
                *self.profile_cache.lock().await = None;
                debug!(event = "claude_token_refreshed");
                Some(credentials)
            }
            Ok(Err(err)) => {
                warn!(event = "claude_token_refresh_failed", error = %err);
                None
            }
            Err(err) => {
                warn!(event = "claude_token_refresh_panicked", error = %err);
                None
            }
        }
    }

    /// Start a device-code login against the console.
    pub async fn start_device_flow(&self) -> AuthResult<DeviceAuthorization> {
        let url = format!("{}/v1/oauth/device/code", self.console_base_url);
        let body = json!({ "client_id": CLIENT_ID, "scope": OAUTH_SCOPE });
        let resp = oauth_http_client()
            .post(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Http(format!(
                "device code request failed: {status}"
            )));
        }
        serde_json::from_slice(&bytes).map_err(|err| AuthError::Invalid(err.to_string()))
    }

    /// Poll the token endpoint until a terminal outcome, backing off on
    /// `authorization_pending` / `slow_down`.
    pub async fn poll_for_token(
        &self,
        device_code: &str,
        interval_secs: u64,
        expires_in_secs: u64,
    ) -> AuthResult<ClaudeCredentials> {
        let mut backoff = PollBackoff::new(interval_secs);
        let deadline = now_unix() + expires_in_secs as i64;
        loop {
            if now_unix() >= deadline {
                return Err(AuthError::DeviceFlowExpired);
            }
            match self.poll_once(device_code).await? {
                PollOutcome::Authorized(tokens) => {
                    let credentials = credentials_from_token_response(tokens);
                    self.store.save(&credentials).await?;
                    *self.profile_cache.lock().await = None;
                    return Ok(credentials);
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => backoff.slow_down(),
                PollOutcome::Expired => return Err(AuthError::DeviceFlowExpired),
                PollOutcome::Denied => return Err(AuthError::DeviceFlowDenied),
            }
            tokio::time::sleep(backoff.delay()).await;
        }
    }

    async fn poll_once(&self, device_code: &str) -> AuthResult<PollOutcome<TokenResponse>> {
        let url = format!("{}/v1/oauth/token", self.console_base_url);
        let body = json!({
            "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
            "device_code": device_code,
            "client_id": CLIENT_ID,
        });
        let resp = oauth_http_client()
            .post(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| AuthError::Http(err.to_string()))?;
        if let Ok(tokens) = serde_json::from_slice::<TokenResponse>(&bytes) {
            return Ok(PollOutcome::Authorized(tokens));
        }
        let error = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.as_str().map(str::to_string))
            })
            .unwrap_or_default();
        Ok(match error.as_str() {
            "authorization_pending" => PollOutcome::Pending,
            "slow_down" => PollOutcome::SlowDown,
            "expired_token" => PollOutcome::Expired,
            "access_denied" => PollOutcome::Denied,
            other => return Err(AuthError::RefreshFailed(other.to_string())),
        })
    }
}

async fn request_refresh(url: &str, refresh_token: &str) -> AuthResult<TokenResponse> {
    let body = json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "client_id": CLIENT_ID,
    });
    let resp = oauth_http_client()
        .post(url)
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .map_err(|err| AuthError::Http(err.to_string()))?;
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| AuthError::Http(err.to_string()))?;
    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        return Err(AuthError::RefreshFailed(format!("{status} {text}")));
    }
    serde_json::from_slice(&bytes).map_err(|err| AuthError::Invalid(err.to_string()))
}

fn apply_token_response(
    mut current: ClaudeCredentials,
    tokens: TokenResponse,
) -> ClaudeCredentials {
    current.oauth.access_token = tokens.access_token;
    if tokens.refresh_token.is_some() {
        current.oauth.refresh_token = tokens.refresh_token;
    }
    current.oauth.expires_at_ms = tokens
        .expires_in
        .map(|expires_in| now_unix_ms() + expires_in * 1000);
    if let Some(scope) = tokens.scope {
        current.oauth.scopes = scope.split(' ').map(str::to_string).collect();
    }
    if tokens.subscription_type.is_some() {
        current.oauth.subscription_type = tokens.subscription_type;
    }
    current
}

fn credentials_from_token_response(tokens: TokenResponse) -> ClaudeCredentials {
    ClaudeCredentials {
        oauth: ClaudeOauthFields {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at_ms: tokens
                .expires_in
                .map(|expires_in| now_unix_ms() + expires_in * 1000),
            scopes: tokens
                .scope
                .map(|scope| scope.split(' ').map(str::to_string).collect())
                .unwrap_or_default(),
            subscription_type: tokens.subscription_type,
        },
    }
}

#[async_trait]
impl TokenManager for ClaudeTokenManager {
    fn provider(&self) -> &'static str {
        "claude"
    }

    async fn get_access_token(&self) -> AuthResult<String> {
        let Some(credentials) = self.store.load().await? else {
            return Err(AuthError::MissingCredentials("claude"));
        };
        if !self.is_expired(&credentials) {
            return Ok(credentials.oauth.access_token);
        }
        if credentials.oauth.refresh_token.is_none() {
            // Not refreshable: hand back the stored token and let the
            // upstream reject it.
            return Ok(credentials.oauth.access_token);
        }
        match self.refresh_token().await {
            Some(refreshed) => Ok(refreshed.oauth.access_token),
            None => Ok(credentials.oauth.access_token),
        }
    }

    async fn get_access_token_with_refresh(&self) -> Option<String> {
        let credentials = self.store.load().await.ok()??;
        if !self.is_expired(&credentials) {
            return Some(credentials.oauth.access_token);
        }
        self.refresh_token()
            .await
            .map(|refreshed| refreshed.oauth.access_token)
    }

    async fn snapshot(&self) -> Option<TokenSnapshot> {
        let credentials = self.store.load().await.ok()??;
        Some(TokenSnapshot {
            provider: "claude",
            access_token: credentials.oauth.access_token.clone(),
            refresh_token: credentials.oauth.refresh_token.clone(),
            expires_at: credentials.oauth.expires_at_ms.map(|ms| ms / 1000),
            scopes: credentials.oauth.scopes.clone(),
            account_id: None,
            extras: json!({
                "subscription_type": credentials.oauth.subscription_type,
            }),
        })
    }

    async fn profile(&self) -> Option<StandardProfile> {
        if let Some(cached) = self.profile_cache.lock().await.clone() {
            return Some(cached);
        }
        let credentials = self.store.load().await.ok()??;
        let profile = StandardProfile {
            email: None,
            plan: credentials.oauth.subscription_type.clone(),
            account_id: None,
            scopes: credentials.oauth.scopes.clone(),
        };
        *self.profile_cache.lock().await = Some(profile.clone());
        Some(profile)
    }

    async fn profile_quick(&self) -> Option<StandardProfile> {
        self.profile_cache.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ccproxy-claude-{name}-{}.json", std::process::id()))
    }

    fn credentials(expires_at_ms: Option<i64>, refresh: Option<&str>) -> ClaudeCredentials {
        ClaudeCredentials {
            oauth: ClaudeOauthFields {
                access_token: "at".into(),
                refresh_token: refresh.map(str::to_string),
                expires_at_ms,
                scopes: vec!["user:inference".into()],
                subscription_type: Some("max".into()),
            },
        }
    }

    #[test]
    fn pkce_challenge_is_derived_from_verifier() {
        let codes = generate_pkce();
        let digest = Sha256::digest(codes.code_verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(codes.code_challenge, expected);
    }

    #[tokio::test]
    async fn expired_without_refresh_token_returns_stored_value() {
        let path = temp_store("no-refresh");
        let manager = ClaudeTokenManager::new(&path);
        manager
            .save_credentials(&credentials(Some(1), None))
            .await
            .unwrap();
        // Expired, not refreshable: stored value comes back unchanged.
        assert_eq!(manager.get_access_token().await.unwrap(), "at");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let path = temp_store("valid");
        let manager = ClaudeTokenManager::new(&path);
        manager
            .save_credentials(&credentials(Some(now_unix_ms() + 3_600_000), Some("rt")))
            .await
            .unwrap();
        assert_eq!(manager.get_access_token().await.unwrap(), "at");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_credentials_is_a_typed_error() {
        let manager = ClaudeTokenManager::new(temp_store("missing"));
        assert!(matches!(
            manager.get_access_token().await,
            Err(AuthError::MissingCredentials("claude"))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_share_one_refresh() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Stub token endpoint counting how often it is hit.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let hits_server = std::sync::Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = std::sync::Arc::clone(&hits_server);
                tokio::spawn(async move {
                    let mut buffer = [0u8; 8192];
                    let _ = socket.read(&mut buffer).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"access_token":"fresh","expires_in":3600}"#;
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                });
            }
        });

        let path = temp_store("single-flight");
        let manager = std::sync::Arc::new(ClaudeTokenManager::with_base_url(
            &path,
            format!("http://{addr}"),
        ));
        manager
            .save_credentials(&credentials(Some(1), Some("rt")))
            .await
            .unwrap();

        let a = std::sync::Arc::clone(&manager);
        let b = std::sync::Arc::clone(&manager);
        let (token_a, token_b) = tokio::join!(
            async move { a.get_access_token().await.unwrap() },
            async move { b.get_access_token().await.unwrap() },
        );
        assert_eq!(token_a, "fresh");
        assert_eq!(token_b, "fresh");
        // Both callers shared a single refresh call.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn token_response_overwrites_expiry() {
        let refreshed = apply_token_response(
            credentials(Some(1), Some("rt")),
            TokenResponse {
                access_token: "new".into(),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
                subscription_type: None,
            },
        );
        assert_eq!(refreshed.oauth.access_token, "new");
        assert_eq!(refreshed.oauth.refresh_token.as_deref(), Some("rt"));
        assert!(refreshed.oauth.expires_at_ms.unwrap() > now_unix_ms());
    }
}
