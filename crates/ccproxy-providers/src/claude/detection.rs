//! CLI fingerprint capture.
//!
//! On startup the real vendor CLI is run once against a local capture
//! server; the headers and system-prompt payload it sends are snapshotted
//! and cached on disk keyed by CLI version. Capture failure degrades to no
//! fingerprint rather than failing the plugin.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ccproxy_common::Headers;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);
/// Headers never taken from the snapshot.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key"];
/// Transport noise the overlay skips.
const IGNORED_HEADERS: &[&str] = &["host", "content-length", "connection", "accept-encoding"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliFingerprint {
    pub cli_version: String,
    pub headers: Headers,
    /// The `system` field of the captured request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
}

/// Capture cache for the Claude CLI.
pub struct ClaudeDetectionService {
    cache_dir: PathBuf,
    cli_binary: String,
    fingerprint: RwLock<Option<Arc<CliFingerprint>>>,
}

impl ClaudeDetectionService {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            cli_binary: "claude".to_string(),
            fingerprint: RwLock::new(None),
        }
    }

    pub async fn fingerprint(&self) -> Option<Arc<CliFingerprint>> {
        self.fingerprint.read().await.clone()
    }

    /// Seed a fingerprint directly, bypassing capture. Used when a
    /// snapshot is supplied out of band.
    pub async fn install_fingerprint(&self, fingerprint: CliFingerprint) {
        *self.fingerprint.write().await = Some(Arc::new(fingerprint));
    }

    /// Non-blocking view for synchronous health snapshots.
    pub fn fingerprint_loaded(&self) -> bool {
        self.fingerprint
            .try_read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Snapshot headers with auth material removed.
    pub async fn overlay_headers(&self) -> Headers {
        let Some(fingerprint) = self.fingerprint().await else {
            return Vec::new();
        };
        fingerprint
            .headers
            .iter()
            .filter(|(name, value)| {
                let name = name.to_ascii_lowercase();
                !SENSITIVE_HEADERS.contains(&name.as_str())
                    && !IGNORED_HEADERS.contains(&name.as_str())
                    && !value.is_empty()
            })
            .cloned()
            .collect()
    }

    pub async fn system_prompt(&self) -> Option<Value> {
        self.fingerprint().await?.system.clone()
    }

    /// Load from the version-keyed cache, or run the capture once.
    pub async fn initialize(&self) {
        let Some(version) = self.cli_version().await else {
            info!(event = "claude_cli_not_found", binary = %self.cli_binary);
            return;
        };
        if let Some(cached) = self.load_cached(&version).await {
            debug!(event = "claude_fingerprint_cache_hit", version = %version);
            *self.fingerprint.write().await = Some(Arc::new(cached));
            return;
        }
        match self.capture(&version).await {
            Ok(fingerprint) => {
                self.store_cached(&fingerprint).await;
                info!(event = "claude_fingerprint_captured", version = %version);
                *self.fingerprint.write().await = Some(Arc::new(fingerprint));
            }
            Err(err) => {
                warn!(event = "claude_fingerprint_capture_failed", error = %err);
            }
        }
    }

    async fn cli_version(&self) -> Option<String> {
        let output = tokio::process::Command::new(&self.cli_binary)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        let version = raw.split_whitespace().next()?.trim().to_string();
        if version.is_empty() { None } else { Some(version) }
    }

    fn cache_path(&self, version: &str) -> PathBuf {
        self.cache_dir.join(format!("claude-fingerprint-{version}.json"))
    }

    async fn load_cached(&self, version: &str) -> Option<CliFingerprint> {
        let raw = tokio::fs::read(self.cache_path(version)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn store_cached(&self, fingerprint: &CliFingerprint) {
        if tokio::fs::create_dir_all(&self.cache_dir).await.is_err() {
            return;
        }
        let raw = serde_json::to_vec_pretty(fingerprint).unwrap_or_default();
        if let Err(err) = tokio::fs::write(self.cache_path(&fingerprint.cli_version), raw).await {
            warn!(event = "claude_fingerprint_cache_write_failed", error = %err);
        }
    }

    /// One-shot local capture server: the CLI is pointed at it, the first
    /// request it sends is recorded and answered with a minimal message.
    async fn capture(&self, version: &str) -> std::io::Result<CliFingerprint> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await?;
            let captured = read_http_request(&mut socket).await?;
            let reply = capture_reply();
            socket.write_all(reply.as_bytes()).await?;
            let _ = socket.shutdown().await;
            Ok::<CapturedRequest, std::io::Error>(captured)
        });

        let mut child = tokio::process::Command::new(&self.cli_binary)
            .args(["-p", "ping", "--max-turns", "1"])
            .env("ANTHROPIC_BASE_URL", format!("http://127.0.0.1:{port}"))
            .env("ANTHROPIC_API_KEY", "capture-placeholder")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let captured = match tokio::time::timeout(CAPTURE_TIMEOUT, accept).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                let _ = child.kill().await;
                return Err(std::io::Error::other(join_err));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "capture timed out",
                ));
            }
        };
        let _ = child.kill().await;

        let system = serde_json::from_slice::<Value>(&captured.body)
            .ok()
            .and_then(|body| body.get("system").cloned());
        Ok(CliFingerprint {
            cli_version: version.to_string(),
            headers: captured.headers,
            system,
        })
    }
}

struct CapturedRequest {
    headers: Headers,
    body: Vec<u8>,
}

/// Minimal HTTP/1.1 request reader: headers, then content-length bytes of
/// body. The capture server sees exactly one request and never needs more.
async fn read_http_request(
    socket: &mut tokio::net::TcpStream,
) -> std::io::Result<CapturedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > 256 * 1024 {
            return Err(std::io::Error::other("header section too large"));
        }
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut headers: Headers = Vec::new();
    let mut content_length = 0usize;
    for line in header_text.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        }
        headers.push((name, value));
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(CapturedRequest { headers, body })
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn capture_reply() -> String {
    let body = serde_json::json!({
        "id": "msg_capture",
        "type": "message",
        "role": "assistant",
        "model": "capture",
        "content": [{"type": "text", "text": "ok"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 1, "output_tokens": 1}
    })
    .to_string();
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"POST / HTTP/1.1\r\nA: b\r\n\r\nbody"), Some(21));
        assert_eq!(find_header_end(b"partial\r\n"), None);
    }

    #[tokio::test]
    async fn overlay_skips_sensitive_and_empty_headers() {
        let service = ClaudeDetectionService::new(std::env::temp_dir());
        service
            .install_fingerprint(CliFingerprint {
                cli_version: "2.0.0".into(),
                headers: vec![
                    ("authorization".into(), "Bearer secret".into()),
                    ("x-api-key".into(), "sk-x".into()),
                    ("anthropic-version".into(), "2023-06-01".into()),
                    ("user-agent".into(), "claude-cli/2.0.0".into()),
                    ("x-empty".into(), "".into()),
                    ("host".into(), "localhost".into()),
                ],
                system: None,
            })
            .await;
        let overlay = service.overlay_headers().await;
        let names: Vec<&str> = overlay.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["anthropic-version", "user-agent"]);
    }

    #[tokio::test]
    async fn capture_reader_parses_headers_and_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_http_request(&mut socket).await.unwrap()
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = r#"{"system":[{"type":"text","text":"captured"}]}"#;
        let request = format!(
            "POST /v1/messages HTTP/1.1\r\nHost: x\r\nanthropic-beta: b1\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let captured = server.await.unwrap();
        assert_eq!(
            ccproxy_common::header_get(&captured.headers, "anthropic-beta"),
            Some("b1")
        );
        let parsed: Value = serde_json::from_slice(&captured.body).unwrap();
        assert_eq!(parsed["system"][0]["text"], "captured");
    }
}
