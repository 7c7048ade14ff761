use bytes::Bytes;

/// One parsed Server-Sent-Events frame: an optional `event:` name and the
/// joined `data:` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        SseFrame {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        SseFrame {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// True for the OpenAI terminal sentinel, which must pass through
    /// conversion untouched.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Re-serialize as a wire frame (`event:` line, `data:` lines, blank
    /// separator). Multi-line data is split back into one `data:` line per
    /// line, per the SSE spec.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if self.data.is_empty() {
            out.push_str("data:\n");
        } else {
            for line in self.data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Incremental SSE decoder. Feed it arbitrary byte chunks; it yields
/// complete frames as blank-line separators arrive and holds partial lines
/// across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut frames);
        }
        frames
    }

    /// Flush any trailing frame at end of stream. Upstreams sometimes omit
    /// the final blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            let mut ignored = Vec::new();
            self.consume_line(&line, &mut ignored);
        }
        let mut frames = Vec::new();
        self.flush_frame(&mut frames);
        frames
    }

    fn consume_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_frame(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = field_value(line, "event") {
            self.event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return;
        }
        if let Some(value) = field_value(line, "data") {
            self.data_lines.push(value.to_string());
        }
    }

    fn flush_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    if line == field {
        return Some("");
    }
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
