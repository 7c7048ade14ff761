use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use ccproxy_common::{Headers, ProxyError, ProxyResult};
use ccproxy_format::{FormatError, FormatRegistry, Stage};
use ccproxy_plugin_core::{HookBus, HookEvent, ProviderAdapter, RequestContext};

use crate::streaming::handler::{StreamOutcome, StreamingHandler};
use crate::upstream::{UpstreamClient, UpstreamRequest};

/// Everything the ingress layer hands the pipeline for one request.
#[derive(Debug)]
pub struct ClientRequest {
    pub method: String,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum PipelineResponse {
    Json {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Headers,
        body: tokio::sync::mpsc::Receiver<Bytes>,
    },
}

impl PipelineResponse {
    pub fn status(&self) -> u16 {
        match self {
            PipelineResponse::Json { status, .. } | PipelineResponse::Stream { status, .. } => {
                *status
            }
        }
    }
}

/// The per-request state machine every provider specializes:
/// receive → stream decision → [streaming | convert → prepare → dispatch →
/// process → convert back] → respond.
pub struct HttpPipeline {
    client: Arc<dyn UpstreamClient>,
    formats: Arc<FormatRegistry>,
    streaming: Arc<StreamingHandler>,
    hooks: HookBus,
}

impl HttpPipeline {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        formats: Arc<FormatRegistry>,
        streaming: Arc<StreamingHandler>,
        hooks: HookBus,
    ) -> Self {
        Self {
            client,
            formats,
            streaming,
            hooks,
        }
    }

    pub fn formats(&self) -> &Arc<FormatRegistry> {
        &self.formats
    }

    pub async fn handle(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        req: ClientRequest,
        ctx: &RequestContext,
    ) -> ProxyResult<PipelineResponse> {
        let started_at = Instant::now();
        self.hooks
            .emit(HookEvent::RequestStart {
                request_id: ctx.request_id.clone(),
                provider: adapter.name().to_string(),
                endpoint: ctx.endpoint().to_string(),
            })
            .await;

        let result = self.handle_inner(adapter, req, ctx).await;

        let status = match &result {
            Ok(response) => response.status(),
            Err(err) => err.status(),
        };
        if let Err(err) = &result {
            self.hooks
                .emit(HookEvent::ProviderError {
                    request_id: ctx.request_id.clone(),
                    provider: adapter.name().to_string(),
                    message: err.to_string(),
                })
                .await;
        }
        self.hooks
            .emit(HookEvent::RequestEnd {
                request_id: ctx.request_id.clone(),
                provider: adapter.name().to_string(),
                status,
                duration_ms: started_at.elapsed().as_millis() as u64,
            })
            .await;
        result
    }

    async fn handle_inner(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        req: ClientRequest,
        ctx: &RequestContext,
    ) -> ProxyResult<PipelineResponse> {
        // Receive: parse the raw bytes into a decoded object once; both
        // representations stay available.
        let decoded: Option<Value> = if req.body.is_empty() {
            None
        } else {
            serde_json::from_slice(&req.body).ok()
        };

        // Stream decision: the body's stream flag or the Accept header.
        let body_wants_stream = decoded
            .as_ref()
            .and_then(|value| value.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let header_wants_stream = StreamingHandler::should_stream_response(&req.headers);
        let wants_stream = body_wants_stream || header_wants_stream;
        debug!(
            event = "stream_decision",
            request_id = %ctx.request_id,
            body_wants_stream,
            header_wants_stream
        );

        // Request-stage format chain.
        let body = if ctx.format_chain.len() > 1 {
            let payload = match decoded.as_ref() {
                Some(value) => value,
                None => {
                    return Err(ProxyError::bad_request(
                        "failed to parse request body for format conversion",
                    ));
                }
            };
            let converted = self
                .formats
                .apply_chain(&ctx.format_chain, Stage::Request, payload)
                .map_err(request_stage_error)?;
            Bytes::from(converted.to_string())
        } else {
            req.body.clone()
        };

        // Provider preparation over pre-filtered headers.
        let headers = filter_request_headers(&req.headers);
        let endpoint = ctx.endpoint().to_string();
        let prepared = adapter
            .prepare_request(body, headers, &endpoint, ctx)
            .await?;
        let url = adapter.target_url(&endpoint).await?;

        if wants_stream {
            return self.run_streaming(adapter, url, req.method, prepared, ctx).await;
        }
        if adapter.stream_only() {
            return self.run_buffered(adapter, url, req.method, prepared, ctx).await;
        }
        self.run_plain(adapter, url, req.method, prepared, ctx).await
    }

    async fn run_plain(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        url: String,
        method: String,
        prepared: ccproxy_plugin_core::PreparedRequest,
        ctx: &RequestContext,
    ) -> ProxyResult<PipelineResponse> {
        let resp = self
            .client
            .send(UpstreamRequest {
                method,
                url,
                headers: prepared.headers,
                body: Some(prepared.body),
                is_stream: false,
            })
            .await?;
        let body = match resp.body {
            crate::upstream::UpstreamBody::Bytes(bytes) => bytes,
            crate::upstream::UpstreamBody::Stream(_) => {
                return Err(ProxyError::internal(
                    "upstream streamed a non-streaming dispatch",
                ));
            }
        };
        let endpoint = ctx.endpoint();
        let body = adapter.process_response(endpoint, resp.status, body)?;
        let body = self.convert_response_body(ctx, resp.status, body)?;
        Ok(PipelineResponse::Json {
            status: resp.status,
            headers: filter_response_headers(&resp.headers),
            body,
        })
    }

    async fn run_streaming(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        url: String,
        method: String,
        prepared: ccproxy_plugin_core::PreparedRequest,
        ctx: &RequestContext,
    ) -> ProxyResult<PipelineResponse> {
        // Reverse direction: provider dialect back to the client dialect.
        let converter = match (ctx.provider_dialect(), ctx.client_dialect()) {
            (Some(from), Some(to)) if ctx.format_chain.len() > 1 => {
                self.formats.stream_converter(from, to)
            }
            _ => None,
        };
        let outcome = self
            .streaming
            .handle_streaming_request(
                self.client.as_ref(),
                UpstreamRequest {
                    method,
                    url,
                    headers: prepared.headers,
                    body: Some(prepared.body),
                    is_stream: true,
                },
                converter,
                adapter.metrics_collector(),
                ctx,
                adapter.name(),
            )
            .await?;

        match outcome {
            StreamOutcome::Stream {
                status,
                headers,
                body,
            } => Ok(PipelineResponse::Stream {
                status,
                headers: filter_response_headers(&headers),
                body,
            }),
            StreamOutcome::Error {
                status,
                headers,
                body,
            } => {
                let body = self.convert_response_body(ctx, status, body)?;
                Ok(PipelineResponse::Json {
                    status,
                    headers: filter_response_headers(&headers),
                    body,
                })
            }
        }
    }

    async fn run_buffered(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        url: String,
        method: String,
        prepared: ccproxy_plugin_core::PreparedRequest,
        ctx: &RequestContext,
    ) -> ProxyResult<PipelineResponse> {
        let buffered = self
            .streaming
            .handle_buffered_streaming_request(
                self.client.as_ref(),
                UpstreamRequest {
                    method,
                    url,
                    headers: prepared.headers,
                    body: Some(prepared.body),
                    is_stream: true,
                },
                adapter.metrics_collector(),
                ctx,
                adapter.name(),
            )
            .await?;
        let endpoint = ctx.endpoint();
        let body = if buffered.status < 400 {
            adapter.process_response(endpoint, buffered.status, buffered.body)?
        } else {
            buffered.body
        };
        let body = self.convert_response_body(ctx, buffered.status, body)?;
        Ok(PipelineResponse::Json {
            status: buffered.status,
            headers: filter_response_headers(&buffered.headers),
            body,
        })
    }

    /// Response-stage chain: `convert_error` on upstream errors,
    /// `convert_response` otherwise. Unparseable bodies pass through so raw
    /// upstream errors still reach the client.
    fn convert_response_body(
        &self,
        ctx: &RequestContext,
        status: u16,
        body: Bytes,
    ) -> ProxyResult<Bytes> {
        if ctx.format_chain.len() < 2 {
            return Ok(body);
        }
        let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        let stage = if status >= 400 {
            Stage::Error
        } else {
            Stage::Response
        };
        let converted = self
            .formats
            .apply_chain(&ctx.format_chain, stage, &payload)
            .map_err(|err| ProxyError::AdapterResponse(err.to_string()))?;
        Ok(Bytes::from(converted.to_string()))
    }
}

fn request_stage_error(err: FormatError) -> ProxyError {
    match err {
        // A hole in the registry is a deployment bug, not a client error.
        FormatError::AdapterMissing { .. } => ProxyError::internal(err.to_string()),
        FormatError::Convert(message) => ProxyError::AdapterRequest(message),
    }
}

const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Client auth material must never leak upstream.
const CLIENT_AUTH: &[&str] = &["authorization", "x-api-key", "x-request-id"];

pub fn filter_request_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&name.as_str()) && !CLIENT_AUTH.contains(&name.as_str())
        })
        .cloned()
        .collect()
}

pub fn filter_response_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ccproxy_plugin_core::{MetricsCollector, NoopCollector, PreparedRequest};
    use ccproxy_protocol::Dialect;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use crate::upstream::{UpstreamBody, UpstreamResponse};

    /// Upstream stub: records the request, replies from a script.
    struct StubClient {
        seen: Mutex<Vec<UpstreamRequest>>,
        status: u16,
        reply: Value,
    }

    impl StubClient {
        fn new(status: u16, reply: Value) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                status,
                reply,
            })
        }
    }

    impl UpstreamClient for StubClient {
        fn send<'a>(
            &'a self,
            req: UpstreamRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>>
        {
            self.seen.lock().unwrap().push(req);
            let status = self.status;
            let reply = self.reply.clone();
            Box::pin(async move {
                Ok(UpstreamResponse {
                    status,
                    headers: vec![("content-type".into(), "application/json".into())],
                    body: UpstreamBody::Bytes(Bytes::from(reply.to_string())),
                })
            })
        }
    }

    struct StubAdapter;

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn target_url(&self, _endpoint: &str) -> ProxyResult<String> {
            Ok("https://upstream.example/v1/messages".to_string())
        }

        async fn prepare_request(
            &self,
            body: Bytes,
            mut headers: Headers,
            _endpoint: &str,
            _ctx: &RequestContext,
        ) -> ProxyResult<PreparedRequest> {
            ccproxy_common::header_set(&mut headers, "authorization", "Bearer upstream-token");
            Ok(PreparedRequest { body, headers })
        }

        fn metrics_collector(&self) -> Box<dyn MetricsCollector> {
            Box::new(NoopCollector)
        }
    }

    fn pipeline(client: Arc<StubClient>) -> HttpPipeline {
        let formats = Arc::new(ccproxy_format::builtin_registry());
        let hooks = HookBus::new(8);
        let streaming = Arc::new(StreamingHandler::new(hooks.clone(), None));
        HttpPipeline::new(client, formats, streaming, hooks)
    }

    fn chat_ctx() -> RequestContext {
        RequestContext::new("req-1")
            .with_endpoint("/v1/chat/completions")
            .with_chain(vec![Dialect::OpenAIChat, Dialect::AnthropicMessages])
    }

    #[tokio::test]
    async fn openai_chat_round_trips_through_anthropic_upstream() {
        let client = StubClient::new(
            200,
            json!({
                "id": "msg_1",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 2}
            }),
        );
        let pipeline = pipeline(Arc::clone(&client));
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(StubAdapter);

        let request = ClientRequest {
            method: "POST".into(),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("authorization".into(), "Bearer client-key".into()),
            ],
            body: Bytes::from(
                json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "messages": [
                        {"role": "system", "content": "x"},
                        {"role": "user", "content": "hi"}
                    ],
                    "max_tokens": 100,
                    "stream": false
                })
                .to_string(),
            ),
        };

        let response = pipeline.handle(&adapter, request, &chat_ctx()).await.unwrap();
        let PipelineResponse::Json { status, body, .. } = response else {
            panic!("expected json response");
        };
        assert_eq!(status, 200);

        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");

        // What went upstream was the converted Anthropic payload with the
        // system message merged, and the client's auth never leaked.
        let seen = client.seen.lock().unwrap();
        let sent: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(sent["system"], "x");
        assert_eq!(sent["max_tokens"], 100);
        assert_eq!(
            ccproxy_common::header_get(&seen[0].headers, "authorization"),
            Some("Bearer upstream-token")
        );
    }

    #[tokio::test]
    async fn upstream_error_converts_through_error_stage() {
        let client = StubClient::new(
            429,
            json!({
                "type": "error",
                "error": {"type": "rate_limit_error", "message": "slow down"}
            }),
        );
        let pipeline = pipeline(client);
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(StubAdapter);

        let request = ClientRequest {
            method: "POST".into(),
            headers: Vec::new(),
            body: Bytes::from(
                json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]})
                    .to_string(),
            ),
        };
        let response = pipeline.handle(&adapter, request, &chat_ctx()).await.unwrap();
        let PipelineResponse::Json { status, body, .. } = response else {
            panic!("expected json response");
        };
        assert_eq!(status, 429);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["message"], "slow down");
    }

    #[tokio::test]
    async fn unparseable_body_with_chain_is_a_400() {
        let pipeline = pipeline(StubClient::new(200, json!({})));
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(StubAdapter);
        let request = ClientRequest {
            method: "POST".into(),
            headers: Vec::new(),
            body: Bytes::from_static(b"{broken"),
        };
        let err = pipeline
            .handle(&adapter, request, &chat_ctx())
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn request_filter_drops_hop_by_hop_and_auth() {
        let headers: Headers = vec![
            ("Host".into(), "proxy".into()),
            ("Authorization".into(), "Bearer x".into()),
            ("X-Api-Key".into(), "k".into()),
            ("X-Request-Id".into(), "r".into()),
            ("Content-Type".into(), "application/json".into()),
            ("Transfer-Encoding".into(), "chunked".into()),
        ];
        let filtered = filter_request_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "Content-Type");
    }

    #[test]
    fn response_filter_keeps_auth_but_drops_framing() {
        let headers: Headers = vec![
            ("Content-Length".into(), "10".into()),
            ("Content-Type".into(), "application/json".into()),
            ("request-id".into(), "up-1".into()),
        ];
        let filtered = filter_response_headers(&headers);
        assert_eq!(filtered.len(), 2);
    }
}
