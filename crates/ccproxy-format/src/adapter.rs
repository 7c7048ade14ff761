use std::error::Error;
use std::fmt;

use ccproxy_protocol::Dialect;
use serde_json::Value;

pub type FormatResult<T> = Result<T, FormatError>;

/// Which traversal of the chain is running. Decides whether a step applies
/// `convert_request`, `convert_response` or `convert_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone)]
pub enum FormatError {
    /// No adapter registered for the requested direction.
    AdapterMissing { from: Dialect, to: Dialect },
    /// The payload could not be converted.
    Convert(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::AdapterMissing { from, to } => {
                write!(f, "no format adapter registered for {from} -> {to}")
            }
            FormatError::Convert(msg) => write!(f, "format conversion failed: {msg}"),
        }
    }
}

impl Error for FormatError {}

/// A translator between two adjacent dialects in a format chain.
///
/// Operations are total functions over decoded JSON objects: they return a
/// new value, never mutate their input, and preserve unknown keys wherever
/// the target dialect permits. Implementations hold no per-request state.
pub trait FormatAdapter: Send + Sync {
    fn convert_request(&self, payload: &Value) -> FormatResult<Value>;
    fn convert_response(&self, payload: &Value) -> FormatResult<Value>;
    fn convert_error(&self, payload: &Value) -> FormatResult<Value>;

    fn convert(&self, stage: Stage, payload: &Value) -> FormatResult<Value> {
        match stage {
            Stage::Request => self.convert_request(payload),
            Stage::Response => self.convert_response(payload),
            Stage::Error => self.convert_error(payload),
        }
    }
}

/// No-op adapter; useful for same-dialect chains and in tests of the chain
/// round-trip property.
#[derive(Debug, Default)]
pub struct IdentityAdapter;

impl FormatAdapter for IdentityAdapter {
    fn convert_request(&self, payload: &Value) -> FormatResult<Value> {
        Ok(payload.clone())
    }

    fn convert_response(&self, payload: &Value) -> FormatResult<Value> {
        Ok(payload.clone())
    }

    fn convert_error(&self, payload: &Value) -> FormatResult<Value> {
        Ok(payload.clone())
    }
}
