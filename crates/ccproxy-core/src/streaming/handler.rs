use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use ccproxy_common::{Headers, ProxyError, header_get, header_set};
use ccproxy_format::StreamConverter;
use ccproxy_plugin_core::{HookBus, HookEvent, MetricsCollector, PricingService, RequestContext};
use ccproxy_protocol::{SseDecoder, SseFrame};

use crate::streaming::handle::{StreamHandle, StreamItem};
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse};

const OUT_CHANNEL_CAPACITY: usize = 32;

/// A streaming upstream call consumed to completion, folded into one
/// non-streaming response.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// Result of a live streaming dispatch: either a converted byte stream for
/// the client, or the upstream's whole error body for the reverse chain.
pub enum StreamOutcome {
    Stream {
        status: u16,
        headers: Headers,
        body: tokio::sync::mpsc::Receiver<Bytes>,
    },
    Error {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

/// Dispatches streaming upstream calls, applies the reverse format adapter
/// frame by frame, and feeds the metrics side channel.
pub struct StreamingHandler {
    hooks: HookBus,
    pricing: Option<Arc<dyn PricingService>>,
}

impl StreamingHandler {
    pub fn new(hooks: HookBus, pricing: Option<Arc<dyn PricingService>>) -> Self {
        Self { hooks, pricing }
    }

    /// Streaming decision on headers alone; the body's `stream: true` flag
    /// is the caller's half of the decision.
    pub fn should_stream_response(headers: &Headers) -> bool {
        header_get(headers, "accept")
            .map(|accept| accept.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }

    /// Dispatch and stream back to the client, converting each SSE frame
    /// through the adapter when one is configured.
    pub async fn handle_streaming_request(
        &self,
        client: &dyn UpstreamClient,
        req: UpstreamRequest,
        converter: Option<Box<dyn StreamConverter>>,
        collector: Box<dyn MetricsCollector>,
        ctx: &RequestContext,
        provider: &str,
    ) -> Result<StreamOutcome, ProxyError> {
        let resp = client.send(req).await?;
        let UpstreamResponse {
            status,
            mut headers,
            body,
        } = resp;

        if status >= 400 {
            let body = collect_body(body).await;
            return Ok(StreamOutcome::Error {
                status,
                headers,
                body,
            });
        }

        let source = match body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                // Upstream answered without streaming; replay it as one
                // chunk so the client still gets an SSE-shaped body.
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.send(bytes).await;
                rx
            }
        };

        header_set(&mut headers, "content-type", "text/event-stream");
        let (out_tx, out_rx) = tokio::sync::mpsc::channel::<Bytes>(OUT_CHANNEL_CAPACITY);
        self.spawn_pump(source, out_tx, converter, collector, ctx, provider);

        Ok(StreamOutcome::Stream {
            status,
            headers,
            body: out_rx,
        })
    }

    fn spawn_pump(
        &self,
        mut source: tokio::sync::mpsc::Receiver<Bytes>,
        out_tx: tokio::sync::mpsc::Sender<Bytes>,
        mut converter: Option<Box<dyn StreamConverter>>,
        mut collector: Box<dyn MetricsCollector>,
        ctx: &RequestContext,
        provider: &str,
    ) {
        let hooks = self.hooks.clone();
        let pricing = self.pricing.clone();
        let request_id = ctx.request_id.clone();
        let provider = provider.to_string();

        // The upstream stream goes through a broadcaster: the response body
        // is one listener, and a disconnecting client triggers the
        // handle's bounded upstream interrupt.
        let (handle_tx, handle_rx) = tokio::sync::mpsc::channel::<Result<Bytes, String>>(16);
        tokio::spawn(async move {
            while let Some(chunk) = source.recv().await {
                if handle_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        let handle = StreamHandle::spawn(handle_rx, StreamHandle::DEFAULT_INTERRUPT_TIMEOUT);

        tokio::spawn(async move {
            hooks
                .emit(HookEvent::StreamStart {
                    request_id: request_id.clone(),
                    provider: provider.clone(),
                })
                .await;

            let (listener_id, mut listener) = handle.add_listener().await;
            let mut decoder = SseDecoder::new();
            let mut client_gone = false;
            while let Some(item) = listener.recv().await {
                let chunk = match item {
                    StreamItem::Chunk(chunk) => chunk,
                    StreamItem::End => break,
                    StreamItem::Error(message) => {
                        warn!(event = "stream_upstream_error", error = %message);
                        break;
                    }
                };
                for frame in decoder.feed(&chunk) {
                    if !pump_frame(
                        &frame,
                        &mut converter,
                        &mut collector,
                        &out_tx,
                        &hooks,
                        &request_id,
                    )
                    .await
                    {
                        client_gone = true;
                        break;
                    }
                }
                if client_gone {
                    break;
                }
            }
            handle.remove_listener(listener_id).await;

            if !client_gone {
                for frame in decoder.finish() {
                    if !pump_frame(
                        &frame,
                        &mut converter,
                        &mut collector,
                        &out_tx,
                        &hooks,
                        &request_id,
                    )
                    .await
                    {
                        break;
                    }
                }
                if let Some(converter) = converter.as_mut() {
                    for frame in converter.finish() {
                        let _ = out_tx.send(frame.to_bytes()).await;
                    }
                }
            }

            let mut metrics = collector.metrics();
            if let (Some(pricing), Some(model)) = (pricing.as_ref(), collector.model()) {
                match pricing.cost_usd(&model, &metrics) {
                    Some(cost) => metrics.cost_usd = Some(cost),
                    None => {
                        debug!(event = "pricing_lookup_missed", model = %model);
                    }
                }
            }
            hooks
                .emit(HookEvent::StreamEnd {
                    request_id,
                    provider,
                    metrics,
                })
                .await;
        });
    }

    /// Consume the upstream stream internally and return a single
    /// non-streaming response. Used for stream-only upstreams when the
    /// client did not ask for streaming.
    pub async fn handle_buffered_streaming_request(
        &self,
        client: &dyn UpstreamClient,
        req: UpstreamRequest,
        mut collector: Box<dyn MetricsCollector>,
        ctx: &RequestContext,
        provider: &str,
    ) -> Result<BufferedResponse, ProxyError> {
        let resp = client.send(req).await?;
        let UpstreamResponse {
            status,
            mut headers,
            body,
        } = resp;

        if status >= 400 {
            let body = collect_body(body).await;
            return Ok(BufferedResponse {
                status,
                headers,
                body,
            });
        }

        self.hooks
            .emit(HookEvent::StreamStart {
                request_id: ctx.request_id.clone(),
                provider: provider.to_string(),
            })
            .await;

        let mut decoder = SseDecoder::new();
        let mut frames: Vec<SseFrame> = Vec::new();
        match body {
            UpstreamBody::Stream(mut rx) => {
                while let Some(chunk) = rx.recv().await {
                    for frame in decoder.feed(&chunk) {
                        collector.process_chunk(&frame.data);
                        frames.push(frame);
                    }
                }
            }
            UpstreamBody::Bytes(bytes) => {
                for frame in decoder.feed(&bytes) {
                    collector.process_chunk(&frame.data);
                    frames.push(frame);
                }
            }
        }
        for frame in decoder.finish() {
            collector.process_chunk(&frame.data);
            frames.push(frame);
        }

        let assembled = assemble_sse_body(&frames).ok_or_else(|| {
            ProxyError::AdapterResponse("streamed upstream produced no assemblable body".into())
        })?;
        let body = Bytes::from(assembled.to_string());

        let mut metrics = collector.metrics();
        if let (Some(pricing), Some(model)) = (self.pricing.as_ref(), collector.model()) {
            if let Some(cost) = pricing.cost_usd(&model, &metrics) {
                metrics.cost_usd = Some(cost);
            }
        }
        self.hooks
            .emit(HookEvent::StreamEnd {
                request_id: ctx.request_id.clone(),
                provider: provider.to_string(),
                metrics,
            })
            .await;

        header_set(&mut headers, "content-type", "application/json");
        Ok(BufferedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Returns false when the client side hung up.
async fn pump_frame(
    frame: &SseFrame,
    converter: &mut Option<Box<dyn StreamConverter>>,
    collector: &mut Box<dyn MetricsCollector>,
    out_tx: &tokio::sync::mpsc::Sender<Bytes>,
    hooks: &HookBus,
    request_id: &str,
) -> bool {
    collector.process_chunk(&frame.data);
    let out_frames = match converter.as_mut() {
        Some(converter) => converter.convert_frame(frame.clone()),
        None => vec![frame.clone()],
    };
    for frame in out_frames {
        let bytes = frame.to_bytes();
        let len = bytes.len();
        if out_tx.send(bytes).await.is_err() {
            warn!(event = "stream_client_disconnected", request_id = %request_id);
            return false;
        }
        hooks
            .emit(HookEvent::StreamChunk {
                request_id: request_id.to_string(),
                bytes: len,
            })
            .await;
    }
    true
}

async fn collect_body(body: UpstreamBody) -> Bytes {
    match body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            Bytes::from(out)
        }
    }
}

/// Fold a complete SSE exchange into one JSON body.
///
/// Preference order: the `response` object of the final
/// `response.completed` event (Codex), then an accumulation of
/// `chat.completion.chunk` frames, then the last parseable JSON frame.
pub fn assemble_sse_body(frames: &[SseFrame]) -> Option<Value> {
    let decoded: Vec<Value> = frames
        .iter()
        .filter(|frame| !frame.is_done())
        .filter_map(|frame| serde_json::from_str(&frame.data).ok())
        .collect();

    if let Some(completed) = decoded
        .iter()
        .rev()
        .find(|event| event.get("type").and_then(Value::as_str) == Some("response.completed"))
    {
        if let Some(response) = completed.get("response") {
            return Some(response.clone());
        }
    }

    let chunks: Vec<&Value> = decoded
        .iter()
        .filter(|event| {
            event.get("object").and_then(Value::as_str) == Some("chat.completion.chunk")
        })
        .collect();
    if !chunks.is_empty() {
        return Some(accumulate_chat_chunks(&chunks));
    }

    decoded.last().cloned()
}

fn accumulate_chat_chunks(chunks: &[&Value]) -> Value {
    let mut content = String::new();
    let mut role = "assistant".to_string();
    let mut finish_reason = Value::Null;
    let mut usage = Value::Null;
    let first = chunks.first();

    for chunk in chunks {
        if let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(part) = delta.get("content").and_then(Value::as_str) {
                    content.push_str(part);
                }
                if let Some(r) = delta.get("role").and_then(Value::as_str) {
                    role = r.to_string();
                }
            }
            if let Some(reason) = choice.get("finish_reason") {
                if !reason.is_null() {
                    finish_reason = reason.clone();
                }
            }
        }
        if let Some(u) = chunk.get("usage") {
            if !u.is_null() {
                usage = u.clone();
            }
        }
    }

    let mut out = serde_json::Map::new();
    out.insert(
        "id".to_string(),
        first
            .and_then(|c| c.get("id"))
            .cloned()
            .unwrap_or(Value::String("chatcmpl-buffered".into())),
    );
    out.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    out.insert(
        "created".to_string(),
        first
            .and_then(|c| c.get("created"))
            .cloned()
            .unwrap_or(Value::from(0)),
    );
    out.insert(
        "model".to_string(),
        first
            .and_then(|c| c.get("model"))
            .cloned()
            .unwrap_or(Value::Null),
    );
    out.insert(
        "choices".to_string(),
        serde_json::json!([{
            "index": 0,
            "message": {"role": role, "content": content},
            "finish_reason": finish_reason,
        }]),
    );
    if !usage.is_null() {
        out.insert("usage".to_string(), usage);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accept_header_triggers_streaming() {
        let headers: Headers = vec![("Accept".into(), "text/event-stream".into())];
        assert!(StreamingHandler::should_stream_response(&headers));
        let headers: Headers = vec![("Accept".into(), "application/json".into())];
        assert!(!StreamingHandler::should_stream_response(&headers));
    }

    #[test]
    fn assemble_prefers_response_completed() {
        let frames = vec![
            SseFrame::named(
                "response.output_text.delta",
                json!({"type": "response.output_text.delta", "delta": "hi"}).to_string(),
            ),
            SseFrame::named(
                "response.completed",
                json!({
                    "type": "response.completed",
                    "response": {"id": "resp_1", "status": "completed"}
                })
                .to_string(),
            ),
        ];
        let body = assemble_sse_body(&frames).unwrap();
        assert_eq!(body["id"], "resp_1");
        assert_eq!(body["status"], "completed");
    }

    #[test]
    fn assemble_accumulates_chat_chunks() {
        let frames = vec![
            SseFrame::data(
                json!({
                    "id": "c1", "object": "chat.completion.chunk", "created": 7, "model": "m",
                    "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hel"},
                                 "finish_reason": null}]
                })
                .to_string(),
            ),
            SseFrame::data(
                json!({
                    "id": "c1", "object": "chat.completion.chunk", "created": 7, "model": "m",
                    "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
                })
                .to_string(),
            ),
            SseFrame::data("[DONE]"),
        ];
        let body = assemble_sse_body(&frames).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 3);
    }

    #[test]
    fn assemble_of_nothing_is_none() {
        assert!(assemble_sse_body(&[SseFrame::data("[DONE]")]).is_none());
    }
}
