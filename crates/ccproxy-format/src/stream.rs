use ccproxy_protocol::SseFrame;

/// Stateful converter applied to a stream of SSE frames during the reverse
/// (provider → client) traversal. One instance lives for one upstream call.
///
/// `convert_frame` may emit zero, one or several frames per input frame;
/// `finish` flushes anything the state machine is still holding when the
/// upstream closes.
pub trait StreamConverter: Send {
    fn convert_frame(&mut self, frame: SseFrame) -> Vec<SseFrame>;

    fn finish(&mut self) -> Vec<SseFrame> {
        Vec::new()
    }
}

/// Used when a chain declares no streaming adapter: frames flow through
/// untouched.
#[derive(Debug, Default)]
pub struct PassthroughStream;

impl StreamConverter for PassthroughStream {
    fn convert_frame(&mut self, frame: SseFrame) -> Vec<SseFrame> {
        vec![frame]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_preserves_done_sentinel() {
        let mut stream = PassthroughStream;
        let frames = stream.convert_frame(SseFrame::data("[DONE]"));
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
    }
}
