use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credentials::{CodexCredentials, StandardProfile, TokenSnapshot};
use crate::error::{AuthError, AuthResult};
use crate::jwt;
use crate::manager::{TokenManager, oauth_http_client};
use crate::now_unix;
use crate::storage::CredentialStore;

const DEFAULT_ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
/// Claim namespace the ChatGPT backend tucks account data under.
const AUTH_CLAIM: &str = "https://api.openai.com/auth";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

pub struct CodexTokenManager {
    store: Arc<CredentialStore<CodexCredentials>>,
    issuer: String,
    refresh_gate: Mutex<()>,
    profile_cache: Mutex<Option<StandardProfile>>,
}

impl CodexTokenManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_issuer(path, DEFAULT_ISSUER)
    }

    pub fn with_issuer(path: impl Into<PathBuf>, issuer: impl Into<String>) -> Self {
        Self {
            store: Arc::new(CredentialStore::new(path)),
            issuer: issuer.into().trim_end_matches('/').to_string(),
            refresh_gate: Mutex::new(()),
            profile_cache: Mutex::new(None),
        }
    }

    pub async fn load_credentials(&self) -> AuthResult<Option<CodexCredentials>> {
        self.store.load().await
    }

    pub async fn save_credentials(&self, credentials: &CodexCredentials) -> AuthResult<()> {
        self.store.save(credentials).await
    }

    /// Expiry comes from the access token's own `exp` claim; a token with
    /// no readable claim is treated as still usable.
    pub fn is_expired(&self, credentials: &CodexCredentials) -> bool {
        match jwt::expiry(&credentials.tokens.access_token) {
            Some(exp) => now_unix() >= exp,
            None => false,
        }
    }

    pub async fn refresh_token(&self) -> Option<CodexCredentials> {
        let _gate = self.refresh_gate.lock().await;
        let current = self.store.load().await.ok()??;
        if !self.is_expired(&current) {
            return Some(current);
        }

        let store = Arc::clone(&self.store);
        let url = format!("{}/oauth/token", self.issuer);
        let refresh_token = current.tokens.refresh_token.clone();
        let handle = tokio::spawn(async move {
            let tokens = request_refresh(&url, &refresh_token).await?;
            let mut updated = current;
            updated.tokens.access_token = tokens.access_token;
            if let Some(refresh_token) = tokens.refresh_token {
                updated.tokens.refresh_token = refresh_token;
            }
            if let Some(id_token) = tokens.id_token {
                updated.tokens.id_token = id_token;
            }
            updated.last_refresh = Some(rfc3339_now());
            store
                .save(&updated)
                .await
                .map(|_| updated)
                .map_err(|err| AuthError::Storage(err.to_string()))
        });
        match handle.await {
            Ok(Ok(credentials)) => {
                *self.profile_cache.lock().await = None;
                debug!(event = "codex_token_refreshed");
                Some(credentials)
            }
            Ok(Err(err)) => {
                warn!(event = "codex_token_refresh_failed", error = %err);
                None
            }
            Err(err) => {
                warn!(event = "codex_token_refresh_panicked", error = %err);
                None
            }
        }
    }

    fn profile_from_claims(credentials: &CodexCredentials) -> StandardProfile {
        let claims = jwt::decode_claims(&credentials.tokens.id_token).unwrap_or(Value::Null);
        let auth = claims.get(AUTH_CLAIM);
        StandardProfile {
            email: claims
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string),
            plan: auth
                .and_then(|a| a.get("chatgpt_plan_type"))
                .and_then(Value::as_str)
                .map(str::to_string),
            account_id: auth
                .and_then(|a| a.get("chatgpt_account_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(credentials.tokens.account_id.clone())),
            scopes: Vec::new(),
        }
    }
}

async fn request_refresh(url: &str, refresh_token: &str) -> AuthResult<TokenResponse> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(refresh_token),
        urlencoding::encode(CLIENT_ID),
    );
    let resp = oauth_http_client()
        .post(url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
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

fn rfc3339_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[async_trait]
impl TokenManager for CodexTokenManager {
    fn provider(&self) -> &'static str {
        "codex"
    }

    async fn get_access_token(&self) -> AuthResult<String> {
        let Some(credentials) = self.store.load().await? else {
            return Err(AuthError::MissingCredentials("codex"));
        };
        if !self.is_expired(&credentials) {
            return Ok(credentials.tokens.access_token);
        }
        match self.refresh_token().await {
            Some(refreshed) => Ok(refreshed.tokens.access_token),
            None => Ok(credentials.tokens.access_token),
        }
    }

    async fn get_access_token_with_refresh(&self) -> Option<String> {
        let credentials = self.store.load().await.ok()??;
        if !self.is_expired(&credentials) {
            return Some(credentials.tokens.access_token);
        }
        self.refresh_token()
            .await
            .map(|refreshed| refreshed.tokens.access_token)
    }

    async fn snapshot(&self) -> Option<TokenSnapshot> {
        let credentials = self.store.load().await.ok()??;
        Some(TokenSnapshot {
            provider: "codex",
            access_token: credentials.tokens.access_token.clone(),
            refresh_token: Some(credentials.tokens.refresh_token.clone()),
            expires_at: jwt::expiry(&credentials.tokens.access_token),
            scopes: Vec::new(),
            account_id: Some(credentials.tokens.account_id.clone()),
            extras: json!({
                "active": credentials.active,
                "last_refresh": credentials.last_refresh,
            }),
        })
    }

    async fn profile(&self) -> Option<StandardProfile> {
        if let Some(cached) = self.profile_cache.lock().await.clone() {
            return Some(cached);
        }
        let credentials = self.store.load().await.ok()??;
        let profile = Self::profile_from_claims(&credentials);
        *self.profile_cache.lock().await = Some(profile.clone());
        Some(profile)
    }

    async fn profile_quick(&self) -> Option<StandardProfile> {
        self.profile_cache.lock().await.clone()
    }
}
