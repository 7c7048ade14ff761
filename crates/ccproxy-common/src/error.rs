use thiserror::Error;

/// One error taxonomy for the whole pipeline.
///
/// Each variant maps to exactly one client-visible status and wire error
/// type; the server layer performs that mapping in a single place.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client sent something we could not parse or that violates limits.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Model capability validation rejected the request before dispatch.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        param: Option<String>,
        code: Option<String>,
    },

    /// No credentials on disk, or the credential chain cannot be used.
    #[error("authentication missing: {0}")]
    AuthMissing(String),

    /// Credentials expired and refresh failed or was impossible.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// Network-level upstream failure (connect, DNS, TLS, timeout).
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Format-chain conversion failed while walking the request stage.
    #[error("request conversion failed: {0}")]
    AdapterRequest(String),

    /// Format-chain conversion failed while walking the response stage.
    #[error("response conversion failed: {0}")]
    AdapterResponse(String),

    /// The client went away mid-stream.
    #[error("streaming interrupted")]
    StreamingInterrupted,

    /// A broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for status mapping and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Validation,
    Auth,
    UpstreamTransport,
    AdapterRequest,
    AdapterResponse,
    StreamingInterrupted,
    Internal,
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ProxyError::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadRequest { .. } => ErrorKind::BadRequest,
            ProxyError::Validation { .. } => ErrorKind::Validation,
            ProxyError::AuthMissing(_) | ProxyError::AuthExpired(_) => ErrorKind::Auth,
            ProxyError::UpstreamTransport(_) => ErrorKind::UpstreamTransport,
            ProxyError::AdapterRequest(_) => ErrorKind::AdapterRequest,
            ProxyError::AdapterResponse(_) => ErrorKind::AdapterResponse,
            ProxyError::StreamingInterrupted => ErrorKind::StreamingInterrupted,
            ProxyError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status the client sees for this error.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest | ErrorKind::Validation | ErrorKind::AdapterRequest => 400,
            ErrorKind::Auth => 401,
            ErrorKind::UpstreamTransport | ErrorKind::AdapterResponse => 502,
            ErrorKind::StreamingInterrupted => 499,
            ErrorKind::Internal => 500,
        }
    }

    /// OpenAI-convention `error.type` string.
    pub fn wire_type(&self) -> &'static str {
        match self.kind() {
            ErrorKind::BadRequest | ErrorKind::Validation | ErrorKind::AdapterRequest => {
                "invalid_request_error"
            }
            ErrorKind::Auth => "authentication_error",
            ErrorKind::UpstreamTransport
            | ErrorKind::AdapterResponse
            | ErrorKind::StreamingInterrupted
            | ErrorKind::Internal => "server_error",
        }
    }

    pub fn wire_param(&self) -> Option<&str> {
        match self {
            ProxyError::Validation { param, .. } => param.as_deref(),
            _ => None,
        }
    }

    pub fn wire_code(&self) -> Option<&str> {
        match self {
            ProxyError::Validation { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_with_code() {
        let err = ProxyError::Validation {
            message: "too many tokens".to_string(),
            param: Some("messages".to_string()),
            code: Some("context_length_exceeded".to_string()),
        };
        assert_eq!(err.status(), 400);
        assert_eq!(err.wire_type(), "invalid_request_error");
        assert_eq!(err.wire_code(), Some("context_length_exceeded"));
    }

    #[test]
    fn adapter_stages_map_to_different_statuses() {
        assert_eq!(ProxyError::AdapterRequest("x".into()).status(), 400);
        assert_eq!(ProxyError::AdapterResponse("x".into()).status(), 502);
    }

    #[test]
    fn auth_errors_are_401_authentication_error() {
        let err = ProxyError::AuthExpired("refresh failed".to_string());
        assert_eq!(err.status(), 401);
        assert_eq!(err.wire_type(), "authentication_error");
    }
}
