use bytes::Bytes;

use crate::sse::SseFraming;

/// Sniffs the upstream body framing and yields logical payload strings.
///
/// OpenAI-family providers speak SSE; Gemini-native endpoints reply with
/// newline-delimited JSON objects or one top-level JSON array depending on
/// the query flags. The first non-whitespace bytes decide the mode and the
/// decision is sticky for the rest of the stream.
#[derive(Debug)]
pub struct PayloadDecoder {
    mode: Mode,
    sniff: String,
}

#[derive(Debug)]
enum Mode {
    Undecided,
    Sse(SseFraming),
    JsonLines(String),
    JsonArray(ArrayScanner),
}

impl Default for PayloadDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadDecoder {
    pub fn new() -> Self {
        Self {
            mode: Mode::Undecided,
            sniff: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };

        match &mut self.mode {
            Mode::Undecided => {
                self.sniff.push_str(text);
                let lead = self.sniff.chars().find(|c| !c.is_whitespace());
                let looks_sse = self.sniff.contains("data:")
                    || self.sniff.contains("event:")
                    || matches!(lead, Some(':'));
                if looks_sse {
                    let mut framer = SseFraming::new();
                    let buffered = std::mem::take(&mut self.sniff);
                    let frames = framer.feed(&Bytes::from(buffered.into_bytes()));
                    self.mode = Mode::Sse(framer);
                    return frames
                        .into_iter()
                        .filter(|f| !f.data.is_empty())
                        .map(|f| f.data)
                        .collect();
                }
                match lead {
                    Some('[') => {
                        let mut scanner = ArrayScanner::new();
                        let buffered = std::mem::take(&mut self.sniff);
                        let items = scanner.scan(&buffered);
                        self.mode = Mode::JsonArray(scanner);
                        items
                    }
                    Some('{') => {
                        let mut buffer = std::mem::take(&mut self.sniff);
                        let items = split_lines(&mut buffer);
                        self.mode = Mode::JsonLines(buffer);
                        items
                    }
                    _ => Vec::new(),
                }
            }
            Mode::Sse(framer) => framer
                .feed(chunk)
                .into_iter()
                .filter(|f| !f.data.is_empty())
                .map(|f| f.data)
                .collect(),
            Mode::JsonLines(buffer) => {
                buffer.push_str(text);
                split_lines(buffer)
            }
            Mode::JsonArray(scanner) => scanner.scan(text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.mode {
            Mode::Undecided => {
                let tail = self.sniff.trim();
                if tail.is_empty() {
                    Vec::new()
                } else {
                    vec![tail.to_string()]
                }
            }
            Mode::Sse(framer) => framer
                .drain_tail()
                .into_iter()
                .filter(|f| !f.data.is_empty())
                .map(|f| f.data)
                .collect(),
            Mode::JsonLines(buffer) => {
                let mut items = split_lines(buffer);
                let tail = buffer.trim();
                if !tail.is_empty() {
                    items.push(tail.to_string());
                }
                buffer.clear();
                items
            }
            Mode::JsonArray(scanner) => scanner.flush(),
        }
    }
}

fn split_lines(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(nl) = buffer.find('\n') {
        let mut line: String = buffer.drain(..=nl).collect();
        line.truncate(line.trim_end_matches(['\n', '\r']).len());
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

/// Extracts top-level objects out of a streamed JSON array without waiting
/// for the closing bracket.
#[derive(Debug)]
struct ArrayScanner {
    item: String,
    depth: usize,
    in_string: bool,
    escaped: bool,
    entered: bool,
}

impl ArrayScanner {
    fn new() -> Self {
        Self {
            item: String::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            entered: false,
        }
    }

    fn scan(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if !self.entered {
                if ch == '[' {
                    self.entered = true;
                }
                continue;
            }
            if self.depth == 0 {
                if ch == '{' {
                    self.depth = 1;
                    self.item.push(ch);
                }
                continue;
            }

            self.item.push(ch);
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.item));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn flush(&mut self) -> Vec<String> {
        if self.depth == 0 && !self.item.trim().is_empty() {
            vec![std::mem::take(&mut self.item)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(decoder: &mut PayloadDecoder, text: &str) -> Vec<String> {
        decoder.push(&Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn sniffs_sse() {
        let mut decoder = PayloadDecoder::new();
        let items = push_str(&mut decoder, "data: {\"x\":1}\n\n");
        assert_eq!(items, vec!["{\"x\":1}"]);
    }

    #[test]
    fn sniffs_json_lines() {
        let mut decoder = PayloadDecoder::new();
        let items = push_str(&mut decoder, "{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(items, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn sniffs_json_array_across_chunks() {
        let mut decoder = PayloadDecoder::new();
        let mut items = push_str(&mut decoder, "[{\"a\":1},\n {\"b\":");
        items.extend(push_str(&mut decoder, "2}]"));
        assert_eq!(items, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn array_strings_with_braces_survive() {
        let mut decoder = PayloadDecoder::new();
        let items = push_str(&mut decoder, "[{\"t\":\"}{\"}]");
        assert_eq!(items, vec!["{\"t\":\"}{\"}"]);
    }

    #[test]
    fn finish_flushes_dangling_object() {
        let mut decoder = PayloadDecoder::new();
        assert!(push_str(&mut decoder, "{\"a\":1}").is_empty());
        assert_eq!(decoder.finish(), vec!["{\"a\":1}"]);
    }
}
