use async_trait::async_trait;
use bytes::Bytes;

use ccproxy_common::{Headers, ProxyResult};

use crate::metrics::MetricsCollector;
use crate::request::RequestContext;

/// Body and headers ready to go upstream.
#[derive(Debug)]
pub struct PreparedRequest {
    pub body: Bytes,
    pub headers: Headers,
}

/// The provider-specific half of the request pipeline.
///
/// The base pipeline (ccproxy-core) owns parsing, stream detection, the
/// format chain and dispatch; implementations of this trait attach
/// authentication, fingerprint headers and payload mutations, and may
/// post-process the upstream body.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the upstream only accepts streaming calls; the pipeline
    /// then serves non-streaming clients through the buffering pathway.
    fn stream_only(&self) -> bool {
        false
    }

    /// Absolute upstream URL for the given route endpoint.
    async fn target_url(&self, endpoint: &str) -> ProxyResult<String>;

    /// Attach auth, inject provider headers/prompts, shape the payload.
    /// Receives headers already stripped of hop-by-hop and client auth.
    async fn prepare_request(
        &self,
        body: Bytes,
        headers: Headers,
        endpoint: &str,
        ctx: &RequestContext,
    ) -> ProxyResult<PreparedRequest>;

    /// Post-process a non-streaming upstream body. Default passthrough.
    fn process_response(&self, _endpoint: &str, _status: u16, body: Bytes) -> ProxyResult<Bytes> {
        Ok(body)
    }

    /// Fresh usage collector for one streaming call.
    fn metrics_collector(&self) -> Box<dyn MetricsCollector>;
}
