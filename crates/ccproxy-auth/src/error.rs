use std::error::Error;
use std::fmt;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone)]
pub enum AuthError {
    /// No credential file on disk.
    MissingCredentials(&'static str),
    /// The credential chain cannot produce a usable token and there is no
    /// refresh path; the user must authenticate again.
    ReauthRequired(&'static str),
    /// The provider's refresh endpoint rejected us.
    RefreshFailed(String),
    /// Device-code flow terminal failures.
    DeviceFlowDenied,
    DeviceFlowExpired,
    /// Disk trouble reading/writing the credential file.
    Storage(String),
    /// Transport trouble talking to the identity provider.
    Http(String),
    /// Malformed token or credential payload.
    Invalid(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingCredentials(provider) => {
                write!(f, "no credentials stored for {provider}")
            }
            AuthError::ReauthRequired(provider) => {
                write!(f, "{provider} re-authentication required")
            }
            AuthError::RefreshFailed(msg) => write!(f, "token refresh failed: {msg}"),
            AuthError::DeviceFlowDenied => write!(f, "device authorization denied"),
            AuthError::DeviceFlowExpired => write!(f, "device authorization expired"),
            AuthError::Storage(msg) => write!(f, "credential storage error: {msg}"),
            AuthError::Http(msg) => write!(f, "identity provider request failed: {msg}"),
            AuthError::Invalid(msg) => write!(f, "invalid credential payload: {msg}"),
        }
    }
}

impl Error for AuthError {}
