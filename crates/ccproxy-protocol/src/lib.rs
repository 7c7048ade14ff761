//! Wire-level types shared by the format chain and the providers.
//!
//! Nothing in here performs IO; the crate models the dialect identifiers,
//! SSE framing, error envelopes and the Anthropic content-block sum that the
//! adapters pattern-match on.

pub mod blocks;
pub mod dialect;
pub mod error_shape;
pub mod sse;

pub use blocks::ContentBlock;
pub use dialect::Dialect;
pub use error_shape::{anthropic_error_body, openai_error_body};
pub use sse::{SseDecoder, SseFrame};
