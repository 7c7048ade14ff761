//! End-to-end pipeline runs over a scripted upstream: live SSE conversion
//! and the buffered pathway for stream-only upstreams.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use ccproxy_common::{Headers, ProxyError, ProxyResult, header_set};
use ccproxy_core::{
    ClientRequest, HttpPipeline, PipelineResponse, StreamingHandler, UpstreamBody, UpstreamClient,
    UpstreamRequest, UpstreamResponse,
};
use ccproxy_format::builtin_registry;
use ccproxy_plugin_core::{
    HookBus, HookEvent, MetricsCollector, PreparedRequest, ProviderAdapter, RequestContext,
    StreamMetrics,
};
use ccproxy_protocol::{Dialect, SseDecoder};

/// Upstream stub replying with a scripted SSE exchange.
struct SseClient {
    frames: Vec<String>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl SseClient {
    fn new(frames: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            frames,
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl UpstreamClient for SseClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>> {
        self.seen.lock().unwrap().push(req);
        let frames = self.frames.clone();
        Box::pin(async move {
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                for frame in frames {
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(UpstreamResponse {
                status: 200,
                headers: vec![("content-type".into(), "text/event-stream".into())],
                body: UpstreamBody::Stream(rx),
            })
        })
    }
}

/// Collector counting usage out of Codex `response.completed` events.
#[derive(Default)]
struct UsageCollector {
    metrics: StreamMetrics,
}

impl MetricsCollector for UsageCollector {
    fn process_chunk(&mut self, chunk: &str) -> bool {
        let Ok(event) = serde_json::from_str::<Value>(chunk) else {
            return false;
        };
        let Some(usage) = event
            .get("response")
            .and_then(|response| response.get("usage"))
        else {
            return false;
        };
        self.metrics.tokens_input = usage.get("input_tokens").and_then(Value::as_i64);
        self.metrics.tokens_output = usage.get("output_tokens").and_then(Value::as_i64);
        true
    }

    fn metrics(&self) -> StreamMetrics {
        self.metrics.clone()
    }
}

struct TestAdapter {
    stream_only: bool,
}

#[async_trait]
impl ProviderAdapter for TestAdapter {
    fn name(&self) -> &'static str {
        "test"
    }

    fn stream_only(&self) -> bool {
        self.stream_only
    }

    async fn target_url(&self, _endpoint: &str) -> ProxyResult<String> {
        Ok("https://upstream.example/v1/endpoint".to_string())
    }

    async fn prepare_request(
        &self,
        body: Bytes,
        mut headers: Headers,
        _endpoint: &str,
        _ctx: &RequestContext,
    ) -> ProxyResult<PreparedRequest> {
        header_set(&mut headers, "authorization", "Bearer test");
        Ok(PreparedRequest { body, headers })
    }

    fn metrics_collector(&self) -> Box<dyn MetricsCollector> {
        Box::new(UsageCollector::default())
    }
}

fn sse(event: &str, data: Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

fn build_pipeline(client: Arc<SseClient>, hooks: HookBus) -> HttpPipeline {
    let formats = Arc::new(builtin_registry());
    let streaming = Arc::new(StreamingHandler::new(hooks.clone(), None));
    HttpPipeline::new(client, formats, streaming, hooks)
}

#[tokio::test]
async fn anthropic_stream_converts_to_openai_chunks() {
    let frames = vec![
        sse(
            "message_start",
            json!({
                "type": "message_start",
                "message": {"id": "msg_s", "model": "claude-3-5-sonnet-20241022",
                            "usage": {"input_tokens": 12}}
            }),
        ),
        sse(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}
            }),
        ),
        sse(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn"},
                "usage": {"input_tokens": 12, "output_tokens": 1}
            }),
        ),
        sse("message_stop", json!({"type": "message_stop"})),
    ];
    let client = SseClient::new(frames);
    let pipeline = build_pipeline(Arc::clone(&client), HookBus::new(16));
    let adapter: Arc<dyn ProviderAdapter> = Arc::new(TestAdapter { stream_only: false });

    let ctx = RequestContext::new("req-stream")
        .with_endpoint("/v1/chat/completions")
        .with_chain(vec![Dialect::OpenAIChat, Dialect::AnthropicMessages]);
    let request = ClientRequest {
        method: "POST".into(),
        headers: Vec::new(),
        body: Bytes::from(
            json!({
                "model": "claude-3-5-sonnet-20241022",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
            .to_string(),
        ),
    };

    let response = pipeline.handle(&adapter, request, &ctx).await.unwrap();
    let PipelineResponse::Stream { status, mut body, .. } = response else {
        panic!("expected streaming response");
    };
    assert_eq!(status, 200);

    let mut decoder = SseDecoder::new();
    let mut frames = Vec::new();
    while let Some(chunk) = body.recv().await {
        frames.extend(decoder.feed(&chunk));
    }
    frames.extend(decoder.finish());

    // role chunk, content chunk, finish chunk, [DONE].
    assert!(frames.len() >= 4);
    let first: Value = serde_json::from_str(&frames[0].data).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
    let second: Value = serde_json::from_str(&frames[1].data).unwrap();
    assert_eq!(second["choices"][0]["delta"]["content"], "hi");
    assert!(frames.last().unwrap().is_done());

    // The upstream saw a streaming dispatch.
    let seen = client.seen.lock().unwrap();
    assert!(seen[0].is_stream);
}

#[tokio::test]
async fn stream_only_upstream_buffers_for_non_streaming_clients() {
    let frames = vec![
        sse(
            "response.output_text.delta",
            json!({"type": "response.output_text.delta", "delta": "par"}),
        ),
        sse(
            "response.completed",
            json!({
                "type": "response.completed",
                "response": {
                    "id": "resp_1",
                    "object": "response",
                    "status": "completed",
                    "model": "gpt-5-codex",
                    "output": [{"type": "message", "id": "msg_1",
                                "content": [{"type": "output_text", "text": "partial"}]}],
                    "usage": {
                        "input_tokens": 40,
                        "output_tokens": 9,
                        "output_tokens_details": {"reasoning_tokens": 4}
                    }
                }
            }),
        ),
    ];
    let hooks = HookBus::new(16);
    let mut events = hooks.subscribe();
    let client = SseClient::new(frames);
    let pipeline = build_pipeline(Arc::clone(&client), hooks);
    let adapter: Arc<dyn ProviderAdapter> = Arc::new(TestAdapter { stream_only: true });

    let ctx = RequestContext::new("req-buffered")
        .with_endpoint("/v1/responses")
        .with_chain(vec![Dialect::OpenAIResponses]);
    let request = ClientRequest {
        method: "POST".into(),
        headers: Vec::new(),
        body: Bytes::from(
            json!({"model": "gpt-5-codex", "input": "hello", "stream": false}).to_string(),
        ),
    };

    let response = pipeline.handle(&adapter, request, &ctx).await.unwrap();
    let PipelineResponse::Json { status, body, headers } = response else {
        panic!("expected a single json response");
    };
    assert_eq!(status, 200);
    assert_eq!(
        ccproxy_common::header_get(&headers, "content-type"),
        Some("application/json")
    );
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["id"], "resp_1");
    assert_eq!(body["usage"]["output_tokens_details"]["reasoning_tokens"], 4);

    // Upstream was still called in streaming mode.
    assert!(client.seen.lock().unwrap()[0].is_stream);

    // The metrics side channel fired with the collected usage.
    let mut saw_stream_end = false;
    while let Ok(event) = events.try_recv() {
        if let HookEvent::StreamEnd { metrics, .. } = event {
            assert_eq!(metrics.tokens_input, Some(40));
            assert_eq!(metrics.tokens_output, Some(9));
            saw_stream_end = true;
        }
    }
    assert!(saw_stream_end);
}
