//! HTTP ingress: the route table, validation middleware and error mapping.

pub mod error;
pub mod routes;
pub mod validation;

pub use routes::{AppState, build_router};
pub use validation::{ValidationSettings, infer_provider};
