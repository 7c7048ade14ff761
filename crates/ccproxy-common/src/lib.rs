//! Shared building blocks for ccproxy.
//!
//! This crate carries the cross-layer error taxonomy and the header list
//! type. It intentionally has no async or HTTP dependencies so every other
//! crate in the workspace can use it.

pub mod error;
pub mod headers;

pub use error::{ErrorKind, ProxyError, ProxyResult};
pub use headers::{Headers, header_append, header_get, header_remove, header_set};
