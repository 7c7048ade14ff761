use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;

use ccproxy_common::ProxyError;
use ccproxy_protocol::error_shape::{anthropic_error_body, openai_error_body};
use ccproxy_protocol::Dialect;

/// Map a pipeline error onto the wire shape of the route's client dialect:
/// Anthropic-native routes get the Anthropic envelope, everything else the
/// OpenAI envelope.
pub fn error_response(err: &ProxyError, client_dialect: Option<Dialect>) -> Response {
    let message = err.to_string();
    let body = match client_dialect {
        Some(Dialect::AnthropicMessages) => {
            anthropic_error_body(&message, anthropic_error_type(err))
        }
        _ => openai_error_body(&message, err.wire_type(), err.wire_param(), err.wire_code()),
    };

    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn anthropic_error_type(err: &ProxyError) -> &'static str {
    match err.wire_type() {
        "invalid_request_error" => "invalid_request_error",
        "authentication_error" => "authentication_error",
        _ => "api_error",
    }
}
