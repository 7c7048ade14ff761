//! Adapters between OpenAI Chat Completions and Anthropic Messages.
//!
//! Both directions are registered independently: the forward direction
//! carries requests toward a Claude upstream, the reverse direction carries
//! responses, errors and SSE streams back to an OpenAI-shaped client.

mod error;
mod request;
mod response;
mod stream;

use std::sync::Arc;

use ccproxy_protocol::Dialect;
use serde_json::Value;

use crate::adapter::{FormatAdapter, FormatResult};
use crate::registry::FormatRegistry;

pub use stream::AnthropicToOpenAIChatStream;

/// `openai.chat_completions -> anthropic.messages`.
#[derive(Debug, Default)]
pub struct OpenAIChatToAnthropic;

impl FormatAdapter for OpenAIChatToAnthropic {
    fn convert_request(&self, payload: &Value) -> FormatResult<Value> {
        request::openai_to_anthropic(payload)
    }

    fn convert_response(&self, payload: &Value) -> FormatResult<Value> {
        response::openai_to_anthropic(payload)
    }

    fn convert_error(&self, payload: &Value) -> FormatResult<Value> {
        error::openai_to_anthropic(payload)
    }
}

/// `anthropic.messages -> openai.chat_completions`.
#[derive(Debug, Default)]
pub struct AnthropicToOpenAIChat;

impl FormatAdapter for AnthropicToOpenAIChat {
    fn convert_request(&self, payload: &Value) -> FormatResult<Value> {
        request::anthropic_to_openai(payload)
    }

    fn convert_response(&self, payload: &Value) -> FormatResult<Value> {
        response::anthropic_to_openai(payload)
    }

    fn convert_error(&self, payload: &Value) -> FormatResult<Value> {
        error::anthropic_to_openai(payload)
    }
}

pub fn register(registry: &mut FormatRegistry) {
    registry.register(
        Dialect::OpenAIChat,
        Dialect::AnthropicMessages,
        Arc::new(OpenAIChatToAnthropic),
    );
    registry.register(
        Dialect::AnthropicMessages,
        Dialect::OpenAIChat,
        Arc::new(AnthropicToOpenAIChat),
    );
    registry.register_stream(Dialect::AnthropicMessages, Dialect::OpenAIChat, || {
        Box::new(AnthropicToOpenAIChatStream::new(now_unix()))
    });
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
