use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Claude credential file, matching the vendor CLI layout on disk:
/// `{"claudeAiOauth": {"accessToken", "refreshToken", "expiresAt", ...}}`.
/// `expiresAt` is milliseconds since the epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeCredentials {
    #[serde(rename = "claudeAiOauth")]
    pub oauth: ClaudeOauthFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeOauthFields {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresAt", default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(rename = "subscriptionType", default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
}

/// Codex credential file:
/// `{"tokens": {...}, "last_refresh", "active"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexCredentials {
    pub tokens: CodexTokens,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexTokens {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub account_id: String,
}

/// Copilot credential file: a GitHub OAuth token plus the short-lived
/// Copilot service token derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotCredentials {
    pub oauth_token: CopilotOauthToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot_token: Option<CopilotServiceToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotOauthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// GitHub OAuth tokens are long-lived; when `expires_in` is present it
    /// counts from `created_at`.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

impl CopilotOauthToken {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        match self.expires_in {
            Some(expires_in) => now_unix >= self.created_at + expires_in,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotServiceToken {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl CopilotServiceToken {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at
    }
}

fn default_true() -> bool {
    true
}

/// Provider-tagged read-only projection of whatever credential record the
/// provider keeps, for diagnostics and health output.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSnapshot {
    pub provider: &'static str,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub extras: Value,
}

/// Profile fields every provider can derive, each in its own way.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StandardProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}
