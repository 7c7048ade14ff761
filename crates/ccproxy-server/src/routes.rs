use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use ccproxy_common::{Headers, ProxyError};
use ccproxy_core::{ClientRequest, HttpPipeline, ModelRegistry, PipelineResponse, TokenCounter};
use ccproxy_plugin_core::{PluginRegistry, ProviderAdapter, RequestContext};
use ccproxy_protocol::Dialect;

use crate::error::error_response;
use crate::validation::{
    ValidationSettings, infer_provider, should_validate, validate_request,
};

/// A route entry: which provider serves the path and through which chain.
#[derive(Clone)]
struct RouteBinding {
    provider: &'static str,
    format_chain: Vec<Dialect>,
}

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<HttpPipeline>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    registry: Arc<tokio::sync::Mutex<PluginRegistry>>,
    models: Arc<ModelRegistry>,
    counter: Arc<TokenCounter>,
    validation: ValidationSettings,
}

impl AppState {
    pub fn new(
        pipeline: Arc<HttpPipeline>,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
        registry: Arc<tokio::sync::Mutex<PluginRegistry>>,
        models: Arc<ModelRegistry>,
        counter: Arc<TokenCounter>,
        validation: ValidationSettings,
    ) -> Self {
        Self {
            pipeline,
            adapters,
            registry,
            models,
            counter,
            validation,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(claude_messages))
        .route("/v1/chat/completions", post(claude_chat_completions))
        .route("/v1/responses", post(codex_responses))
        .route("/codex/responses", post(codex_responses))
        .route("/copilot/chat/completions", post(copilot_chat_completions))
        .route("/v1/models", get(models_list))
        .route("/health", get(health))
        .with_state(state)
}

async fn claude_messages(
    State(state): State<AppState>,
    method: Method,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let binding = RouteBinding {
        provider: "claude",
        format_chain: vec![Dialect::AnthropicMessages],
    };
    dispatch(state, binding, "/v1/messages", method, headers, body).await
}

async fn claude_chat_completions(
    State(state): State<AppState>,
    method: Method,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let binding = RouteBinding {
        provider: "claude",
        format_chain: vec![Dialect::OpenAIChat, Dialect::AnthropicMessages],
    };
    dispatch(state, binding, "/v1/chat/completions", method, headers, body).await
}

async fn codex_responses(
    State(state): State<AppState>,
    method: Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let binding = RouteBinding {
        provider: "codex",
        format_chain: vec![Dialect::OpenAIResponses],
    };
    let endpoint = uri.path().to_string();
    dispatch(state, binding, &endpoint, method, headers, body).await
}

async fn copilot_chat_completions(
    State(state): State<AppState>,
    method: Method,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let binding = RouteBinding {
        provider: "copilot",
        format_chain: vec![Dialect::OpenAIChat],
    };
    dispatch(
        state,
        binding,
        "/copilot/chat/completions",
        method,
        headers,
        body,
    )
    .await
}

async fn dispatch(
    state: AppState,
    binding: RouteBinding,
    endpoint: &str,
    method: Method,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::now_v7().to_string();
    let client_dialect = binding.format_chain.first().copied();
    let ctx = RequestContext::new(&request_id)
        .with_endpoint(endpoint)
        .with_chain(binding.format_chain.clone());

    info!(
        event = "request_received",
        request_id = %request_id,
        provider = binding.provider,
        endpoint = %endpoint
    );

    // Model validation first: a rejected request never reaches the pool.
    let mut warnings = Vec::new();
    if should_validate(endpoint) {
        let decoded: Option<Value> = serde_json::from_slice(&body).ok();
        if let Some(payload) = decoded {
            let provider = infer_provider(endpoint);
            let card = match payload.get("model").and_then(Value::as_str) {
                Some(model_id) => state.models.get_model(model_id, provider).await,
                None => None,
            };
            match validate_request(&state.validation, card, &payload, &state.counter) {
                Ok(outcome) => warnings = outcome.warnings,
                Err(err) => return error_response(&err, client_dialect),
            }
        }
    }

    let Some(adapter) = state.adapters.get(binding.provider) else {
        return error_response(
            &ProxyError::internal(format!("provider {} not initialized", binding.provider)),
            client_dialect,
        );
    };

    let request = ClientRequest {
        method: method.to_string(),
        headers: headermap_to_vec(&headers),
        body,
    };

    match state.pipeline.handle(adapter, request, &ctx).await {
        Ok(response) => {
            let mut resp = to_axum_response(response, &request_id);
            for warning in warnings {
                if let Ok(value) = HeaderValue::from_str(&warning) {
                    resp.headers_mut()
                        .append(HeaderName::from_static("x-model-warning"), value);
                }
            }
            resp
        }
        Err(err) => error_response(&err, client_dialect),
    }
}

/// Synthetic OpenAI-style models list assembled from the registry.
async fn models_list(State(state): State<AppState>) -> Response {
    let models = state.models.all_models().await;
    let data: Vec<Value> = models
        .iter()
        .map(|card| {
            json!({
                "id": card.id,
                "object": "model",
                "owned_by": card.owned_by.clone().unwrap_or_else(|| card.provider.clone()),
            })
        })
        .collect();
    axum::Json(json!({"object": "list", "data": data})).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let registry = state.registry.lock().await;
    axum::Json(json!({
        "status": "ok",
        "plugins": registry.health(),
    }))
    .into_response()
}

fn to_axum_response(response: PipelineResponse, request_id: &str) -> Response {
    match response {
        PipelineResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            apply_headers(&mut resp, &headers);
            stamp_request_id(&mut resp, request_id);
            resp
        }
        PipelineResponse::Stream {
            status,
            headers,
            body,
        } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            apply_headers(&mut resp, &headers);
            // Hint reverse proxies not to buffer SSE.
            resp.headers_mut()
                .entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            resp.headers_mut()
                .entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
            stamp_request_id(&mut resp, request_id);
            resp
        }
    }
}

fn apply_headers(resp: &mut Response, headers: &Headers) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            resp.headers_mut().append(name, value);
        }
    }
}

fn stamp_request_id(resp: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static("x-ccproxy-request-id"), value);
    }
}

fn headermap_to_vec(headers: &axum::http::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}
