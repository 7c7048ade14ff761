use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credentials::{
    CopilotCredentials, CopilotOauthToken, CopilotServiceToken, StandardProfile, TokenSnapshot,
};
use crate::device::{DeviceAuthorization, PollBackoff, PollOutcome};
use crate::error::{AuthError, AuthResult};
use crate::manager::{TokenManager, oauth_http_client};
use crate::now_unix;
use crate::storage::CredentialStore;

const GITHUB_BASE_URL: &str = "https://github.com";
const GITHUB_API_BASE_URL: &str = "https://api.github.com";
/// Client id of the GitHub Copilot editor integration.
const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const DEVICE_SCOPE: &str = "read:user";

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: String,
    expires_at: i64,
}

/// Two-stage manager: the long-lived GitHub OAuth token is exchanged for a
/// short-lived (< 1 h) Copilot service token on demand. An expired OAuth
/// token is a terminal re-authentication error, never a silent retry.
pub struct CopilotTokenManager {
    store: Arc<CredentialStore<CopilotCredentials>>,
    github_base_url: String,
    api_base_url: String,
    refresh_gate: Mutex<()>,
    profile_cache: Mutex<Option<StandardProfile>>,
}

impl CopilotTokenManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_base_urls(path, GITHUB_BASE_URL, GITHUB_API_BASE_URL)
    }

    pub fn with_base_urls(
        path: impl Into<PathBuf>,
        github_base_url: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store: Arc::new(CredentialStore::new(path)),
            github_base_url: github_base_url.into().trim_end_matches('/').to_string(),
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            refresh_gate: Mutex::new(()),
            profile_cache: Mutex::new(None),
        }
    }

    pub async fn load_credentials(&self) -> AuthResult<Option<CopilotCredentials>> {
        self.store.load().await
    }

    pub async fn save_credentials(&self, credentials: &CopilotCredentials) -> AuthResult<()> {
        let mut stamped = credentials.clone();
        stamped.updated_at = now_unix();
        if stamped.created_at == 0 {
            stamped.created_at = stamped.updated_at;
        }
        self.store.save(&stamped).await
    }

    /// Expired when any mandatory token in the chain has passed its expiry.
    pub fn is_expired(&self, credentials: &CopilotCredentials) -> bool {
        let now = now_unix();
        match &credentials.copilot_token {
            Some(token) => token.is_expired(now) || credentials.oauth_token.is_expired(now),
            None => true,
        }
    }

    /// Service token, exchanging through the OAuth token when needed.
    pub async fn ensure_copilot_token(&self) -> AuthResult<String> {
        let Some(credentials) = self.store.load().await? else {
            return Err(AuthError::MissingCredentials("copilot"));
        };
        let now = now_unix();
        if credentials.oauth_token.is_expired(now) {
            return Err(AuthError::ReauthRequired("copilot"));
        }
        if let Some(token) = &credentials.copilot_token {
            if !token.is_expired(now) {
                return Ok(token.token.clone());
            }
        }
        match self.refresh_token().await {
            Some(refreshed) => refreshed
                .copilot_token
                .map(|token| token.token)
                .ok_or(AuthError::ReauthRequired("copilot")),
            None => Err(AuthError::RefreshFailed(
                "copilot token exchange failed".to_string(),
            )),
        }
    }

    pub async fn ensure_oauth_token(&self) -> AuthResult<String> {
        let Some(credentials) = self.store.load().await? else {
            return Err(AuthError::MissingCredentials("copilot"));
        };
        if credentials.oauth_token.is_expired(now_unix()) {
            return Err(AuthError::ReauthRequired("copilot"));
        }
        Ok(credentials.oauth_token.access_token)
    }

    /// Exchange the OAuth token for a fresh service token and persist it.
    pub async fn refresh_token(&self) -> Option<CopilotCredentials> {
        let _gate = self.refresh_gate.lock().await;
        let current = self.store.load().await.ok()??;
        let now = now_unix();
        if let Some(token) = &current.copilot_token {
            if !token.is_expired(now) {
                return Some(current);
            }
        }
        if current.oauth_token.is_expired(now) {
            return None;
        }

        let store = Arc::clone(&self.store);
        let url = format!("{}/copilot_internal/v2/token", self.api_base_url);
        let oauth_token = current.oauth_token.access_token.clone();
        let handle = tokio::spawn(async move {
            let exchanged = exchange_copilot_token(&url, &oauth_token).await?;
            let mut updated = current;
            updated.copilot_token = Some(CopilotServiceToken {
                token: exchanged.token,
                expires_at: exchanged.expires_at,
            });
            updated.updated_at = now_unix();
            store
                .save(&updated)
                .await
                .map(|_| updated)
                .map_err(|err| AuthError::Storage(err.to_string()))
        });
        match handle.await {
            Ok(Ok(credentials)) => {
                *self.profile_cache.lock().await = None;
                debug!(event = "copilot_token_exchanged");
                Some(credentials)
            }
            Ok(Err(err)) => {
                warn!(event = "copilot_token_exchange_failed", error = %err);
                None
            }
            Err(err) => {
                warn!(event = "copilot_token_exchange_panicked", error = %err);
                None
            }
        }
    }

    pub async fn start_device_flow(&self) -> AuthResult<DeviceAuthorization> {
        let url = format!("{}/login/device/code", self.github_base_url);
        let resp = oauth_http_client()
            .post(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(json!({ "client_id": CLIENT_ID, "scope": DEVICE_SCOPE }).to_string())
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

    pub async fn poll_for_token(
        &self,
        device_code: &str,
        interval_secs: u64,
        expires_in_secs: u64,
    ) -> AuthResult<CopilotOauthToken> {
        let mut backoff = PollBackoff::new(interval_secs);
        let deadline = now_unix() + expires_in_secs as i64;
        loop {
            if now_unix() >= deadline {
                return Err(AuthError::DeviceFlowExpired);
            }
            match self.poll_once(device_code).await? {
                PollOutcome::Authorized(token) => return Ok(token),
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => backoff.slow_down(),
                PollOutcome::Expired => return Err(AuthError::DeviceFlowExpired),
                PollOutcome::Denied => return Err(AuthError::DeviceFlowDenied),
            }
            tokio::time::sleep(backoff.delay()).await;
        }
    }

    /// Full login: poll the device flow to completion, exchange for the
    /// service token, fetch the user profile, persist everything.
    pub async fn complete_authorization(
        &self,
        device_code: &str,
        interval_secs: u64,
        expires_in_secs: u64,
    ) -> AuthResult<CopilotCredentials> {
        let oauth_token = self
            .poll_for_token(device_code, interval_secs, expires_in_secs)
            .await?;
        let url = format!("{}/copilot_internal/v2/token", self.api_base_url);
        let exchanged = exchange_copilot_token(&url, &oauth_token.access_token).await?;
        let profile = self.fetch_user_profile(&oauth_token.access_token).await;
        let credentials = CopilotCredentials {
            oauth_token,
            copilot_token: Some(CopilotServiceToken {
                token: exchanged.token,
                expires_at: exchanged.expires_at,
            }),
            account_type: profile.as_ref().and_then(|p| p.plan.clone()),
            created_at: now_unix(),
            updated_at: now_unix(),
        };
        self.save_credentials(&credentials).await?;
        *self.profile_cache.lock().await = profile;
        Ok(credentials)
    }

    async fn poll_once(&self, device_code: &str) -> AuthResult<PollOutcome<CopilotOauthToken>> {
        let url = format!("{}/login/oauth/access_token", self.github_base_url);
        let body = json!({
            "client_id": CLIENT_ID,
            "device_code": device_code,
            "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
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
        let parsed: DeviceTokenResponse =
            serde_json::from_slice(&bytes).map_err(|err| AuthError::Invalid(err.to_string()))?;
        if let Some(access_token) = parsed.access_token {
            return Ok(PollOutcome::Authorized(CopilotOauthToken {
                access_token,
                token_type: parsed.token_type,
                scope: parsed.scope,
                created_at: now_unix(),
                expires_in: None,
            }));
        }
        Ok(match parsed.error.as_deref() {
            Some("authorization_pending") => PollOutcome::Pending,
            Some("slow_down") => PollOutcome::SlowDown,
            Some("expired_token") => PollOutcome::Expired,
            Some("access_denied") => PollOutcome::Denied,
            other => {
                return Err(AuthError::RefreshFailed(
                    other.unwrap_or("unknown device flow error").to_string(),
                ));
            }
        })
    }

    async fn fetch_user_profile(&self, oauth_token: &str) -> Option<StandardProfile> {
        let url = format!("{}/user", self.api_base_url);
        let resp = oauth_http_client()
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("token {oauth_token}"))
            .header("User-Agent", "ccproxy")
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let value: Value = serde_json::from_slice(&resp.bytes().await.ok()?).ok()?;
        Some(StandardProfile {
            email: value.get("email").and_then(Value::as_str).map(str::to_string),
            plan: value
                .get("plan")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            account_id: value.get("login").and_then(Value::as_str).map(str::to_string),
            scopes: Vec::new(),
        })
    }
}

async fn exchange_copilot_token(url: &str, oauth_token: &str) -> AuthResult<CopilotTokenResponse> {
    let resp = oauth_http_client()
        .get(url)
        .header("Accept", "application/json")
        .header("Authorization", format!("token {oauth_token}"))
        .header("User-Agent", "ccproxy")
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

#[async_trait]
impl TokenManager for CopilotTokenManager {
    fn provider(&self) -> &'static str {
        "copilot"
    }

    async fn get_access_token(&self) -> AuthResult<String> {
        self.ensure_copilot_token().await
    }

    async fn get_access_token_with_refresh(&self) -> Option<String> {
        self.ensure_copilot_token().await.ok()
    }

    async fn snapshot(&self) -> Option<TokenSnapshot> {
        let credentials = self.store.load().await.ok()??;
        let access_token = credentials
            .copilot_token
            .as_ref()
            .map(|token| token.token.clone())
            .unwrap_or_else(|| credentials.oauth_token.access_token.clone());
        let scopes = credentials
            .oauth_token
            .scope
            .as_deref()
            .map(|scope| {
                scope
                    .split(' ')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(TokenSnapshot {
            provider: "copilot",
            access_token,
            refresh_token: None,
            expires_at: credentials
                .copilot_token
                .as_ref()
                .map(|token| token.expires_at),
            scopes,
            account_id: None,
            extras: json!({
                "account_type": credentials.account_type,
                "has_copilot_token": credentials.copilot_token.is_some(),
            }),
        })
    }

    async fn profile(&self) -> Option<StandardProfile> {
        if let Some(cached) = self.profile_cache.lock().await.clone() {
            return Some(cached);
        }
        let oauth_token = self.ensure_oauth_token().await.ok()?;
        let profile = self.fetch_user_profile(&oauth_token).await?;
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
        std::env::temp_dir().join(format!("ccproxy-copilot-{name}-{}.json", std::process::id()))
    }

    fn credentials(
        oauth_expires_in: Option<i64>,
        service_expires_at: Option<i64>,
    ) -> CopilotCredentials {
        CopilotCredentials {
            oauth_token: CopilotOauthToken {
                access_token: "gho_x".into(),
                token_type: Some("bearer".into()),
                scope: Some("read:user".into()),
                created_at: now_unix(),
                expires_in: oauth_expires_in,
            },
            copilot_token: service_expires_at.map(|expires_at| CopilotServiceToken {
                token: "svc".into(),
                expires_at,
            }),
            account_type: None,
            created_at: now_unix(),
            updated_at: now_unix(),
        }
    }

    #[tokio::test]
    async fn valid_service_token_is_returned_without_exchange() {
        let path = temp_store("valid");
        let manager = CopilotTokenManager::new(&path);
        manager
            .save_credentials(&credentials(None, Some(now_unix() + 600)))
            .await
            .unwrap();
        assert_eq!(manager.ensure_copilot_token().await.unwrap(), "svc");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn expired_oauth_token_is_reauth_required() {
        let path = temp_store("reauth");
        let manager = CopilotTokenManager::new(&path);
        let mut creds = credentials(Some(-10), Some(now_unix() + 600));
        creds.oauth_token.created_at = now_unix();
        manager.save_credentials(&creds).await.unwrap();
        assert!(matches!(
            manager.ensure_copilot_token().await,
            Err(AuthError::ReauthRequired("copilot"))
        ));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_credentials_is_typed() {
        let manager = CopilotTokenManager::new(temp_store("missing"));
        assert!(matches!(
            manager.ensure_copilot_token().await,
            Err(AuthError::MissingCredentials("copilot"))
        ));
    }

    #[test]
    fn expiry_follows_the_token_chain() {
        let manager = CopilotTokenManager::new(temp_store("expiry"));
        // Missing service token counts as expired.
        assert!(manager.is_expired(&credentials(None, None)));
        // Live service token + live OAuth token is not expired.
        assert!(!manager.is_expired(&credentials(None, Some(now_unix() + 600))));
        // Stale service token is expired even with a live OAuth token.
        assert!(manager.is_expired(&credentials(None, Some(now_unix() - 1))));
    }

    #[tokio::test]
    async fn save_bumps_updated_at() {
        let path = temp_store("stamp");
        let manager = CopilotTokenManager::new(&path);
        let mut creds = credentials(None, None);
        creds.updated_at = 0;
        manager.save_credentials(&creds).await.unwrap();
        let loaded = manager.load_credentials().await.unwrap().unwrap();
        assert!(loaded.updated_at > 0);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
