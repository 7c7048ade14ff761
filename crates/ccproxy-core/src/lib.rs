//! The request pipeline and its supporting services.
//!
//! Everything a request crosses after routing lives here: the connection
//! pool, the upstream client, the base HTTP adapter pipeline, the streaming
//! handler with its metrics side channel, the model registry, and token
//! counting. Provider specifics plug in through
//! `ccproxy_plugin_core::ProviderAdapter`.

pub mod models;
pub mod pipeline;
pub mod pool;
pub mod streaming;
pub mod tokens;
pub mod upstream;

pub use models::{ModelCard, ModelFetcher, ModelRegistry};
pub use pipeline::{ClientRequest, HttpPipeline, PipelineResponse};
pub use pool::{ConnectionPool, PoolConfig};
pub use streaming::handle::{StreamHandle, StreamItem};
pub use streaming::handler::{BufferedResponse, StreamOutcome, StreamingHandler};
pub use tokens::TokenCounter;
pub use upstream::{
    UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse, WreqUpstreamClient,
};
