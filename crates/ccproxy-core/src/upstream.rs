use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;

use ccproxy_common::{Headers, ProxyError};

use crate::pool::ConnectionPool;

/// Channel capacity between the upstream reader task and consumers.
const STREAM_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

/// The one seam where the pipeline performs network IO. Tests substitute a
/// stub; production uses `WreqUpstreamClient`.
pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>>;
}

/// Pool-backed client. The pool key is derived from the upstream
/// scheme+host; streaming requests get the longer streaming timeout.
pub struct WreqUpstreamClient {
    pool: Arc<ConnectionPool>,
}

impl WreqUpstreamClient {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProxyError>> + Send + 'a>> {
        Box::pin(async move {
            let base_url = scheme_host(&req.url);
            let client = if req.is_stream {
                self.pool.get_streaming_client(base_url.as_deref()).await
            } else {
                self.pool.get_client(base_url.as_deref(), None).await
            }
            .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;

            let method = match req.method.to_ascii_uppercase().as_str() {
                "GET" => wreq::Method::GET,
                "POST" => wreq::Method::POST,
                "PUT" => wreq::Method::PUT,
                "PATCH" => wreq::Method::PATCH,
                "DELETE" => wreq::Method::DELETE,
                other => {
                    return Err(ProxyError::internal(format!(
                        "unsupported upstream method: {other}"
                    )));
                }
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder
                .send()
                .await
                .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;
            convert_response(resp, req.is_stream).await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
) -> Result<UpstreamResponse, ProxyError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    // Error bodies come back whole even on streaming calls so the reverse
    // chain can convert them.
    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp
            .bytes()
            .await
            .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let Ok(chunk) = item else {
                break;
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// `scheme://host[:port]` of a URL, for pool keying.
pub fn scheme_host(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_host_strips_path_and_query() {
        assert_eq!(
            scheme_host("https://api.anthropic.com/v1/messages?beta=1").as_deref(),
            Some("https://api.anthropic.com")
        );
        assert_eq!(
            scheme_host("https://chatgpt.com:8443/backend-api/codex").as_deref(),
            Some("https://chatgpt.com:8443")
        );
        assert_eq!(scheme_host("not a url"), None);
    }
}
