//! Format-chain translation between wire dialects.
//!
//! A format chain is an ordered list of dialects declared per route. The
//! request stage walks the chain left to right; the response and error
//! stages walk it right to left, looking up the reverse-direction adapter
//! for every step. Both directions of a pair are registered independently,
//! so a missing direction is a typed error rather than an implicit inverse.

pub mod adapter;
pub mod openai_anthropic;
pub mod registry;
pub mod stream;

pub use adapter::{FormatAdapter, FormatError, FormatResult, Stage};
pub use registry::{ComposedAdapter, FormatRegistry, chain_pairs};
pub use stream::{PassthroughStream, StreamConverter};

/// Build the registry with every built-in adapter pair installed.
pub fn builtin_registry() -> registry::FormatRegistry {
    let mut registry = registry::FormatRegistry::new();
    openai_anthropic::register(&mut registry);
    registry
}
