use bytes::Bytes;

/// Terminal payload emitted by OpenAI-shaped streams.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One logical server-sent event: a run of `field: value` lines closed by a
/// blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

/// Incremental SSE framer. Chunk boundaries may fall anywhere, including in
/// the middle of a UTF-8 sequence of a field value, so input is buffered until
/// a full line is available.
#[derive(Debug, Default)]
pub struct SseFraming {
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFraming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame completed by it.
    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(nl) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=nl).collect();
            let mut line = String::from_utf8_lossy(&raw[..nl]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut out);
        }

        out
    }

    /// Flush whatever is buffered at end of stream.
    pub fn drain_tail(&mut self) -> Vec<SseFrame> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.accept_field(&line);
        }
        self.close_frame(&mut out);
        out
    }

    fn take_line(&mut self, line: &str, out: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.close_frame(out);
            return;
        }
        if line.starts_with(':') {
            // Comment line (heartbeats and the like).
            return;
        }
        self.accept_field(line);
    }

    fn accept_field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if line == "event" {
            self.event = None;
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data.push(String::new());
        }
        // Unknown fields (id, retry, ...) are relayed downstream untouched by
        // the caller; the framer only cares about event/data.
    }

    fn close_frame(&mut self, out: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data.is_empty() {
            return;
        }
        out.push(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        });
    }
}

/// Encode a JSON payload as a `data: <json>\n\n` frame.
pub fn data_frame(payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(payload.len() + 8);
    buf.extend_from_slice(b"data: ");
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\n\n");
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(framer: &mut SseFraming, text: &str) -> Vec<SseFrame> {
        framer.feed(&Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn frames_split_on_blank_line() {
        let mut framer = SseFraming::new();
        let frames = feed_str(&mut framer, "data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[1].is_done());
    }

    #[test]
    fn chunk_boundary_inside_line() {
        let mut framer = SseFraming::new();
        assert!(feed_str(&mut framer, "data: par").is_empty());
        let frames = feed_str(&mut framer, "tial\n\n");
        assert_eq!(frames, vec![SseFrame { event: None, data: "partial".into() }]);
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut framer = SseFraming::new();
        let frames = feed_str(&mut framer, "data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn named_event_and_crlf() {
        let mut framer = SseFraming::new();
        let frames = feed_str(&mut framer, "event: usage\r\ndata: {}\r\n\r\n");
        assert_eq!(frames[0].event.as_deref(), Some("usage"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn comments_are_skipped() {
        let mut framer = SseFraming::new();
        assert!(feed_str(&mut framer, ": keep-alive\n\n").is_empty());
    }

    #[test]
    fn tail_flush_emits_unterminated_frame() {
        let mut framer = SseFraming::new();
        assert!(feed_str(&mut framer, "data: tail").is_empty());
        let frames = framer.drain_tail();
        assert_eq!(frames[0].data, "tail");
    }

    #[test]
    fn data_frame_wraps_payload() {
        assert_eq!(&data_frame(b"{}")[..], b"data: {}\n\n");
    }
}
