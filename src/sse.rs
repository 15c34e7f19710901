use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

/// Upstream frames occasionally carry very large payloads; anything beyond
/// this is treated as a broken stream.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Thinking,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

/// Line reader over an SSE byte stream. Yields the payload of each `data:`
/// line; `[DONE]` ends the stream. A final unterminated line is flushed at
/// EOF.
pub struct DataLines<S> {
    stream: S,
    buffer: String,
    eof: bool,
    done: bool,
}

impl<S> DataLines<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: String::new(),
            eof: false,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                if let Some(data) = parse_data_line(line.trim_end_matches(['\n', '\r'])) {
                    if data == "[DONE]" {
                        self.done = true;
                        return None;
                    }
                    return Some(data);
                }
                continue;
            }
            if self.eof {
                self.done = true;
                if self.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut self.buffer);
                return match parse_data_line(line.trim_end_matches('\r')) {
                    Some(data) if data != "[DONE]" => Some(data),
                    _ => None,
                };
            }
            if self.buffer.len() > MAX_LINE_BYTES {
                self.done = true;
                return None;
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(_)) | None => {
                    self.eof = true;
                }
            }
        }
    }
}

fn parse_data_line(line: &str) -> Option<String> {
    let payload = line.strip_prefix("data:")?;
    Some(payload.trim().to_string())
}

/// One parser step: route the chunk's `p`/`v` fields into segments and
/// detect the FINISHED status marker. The returned kind is the sticky
/// current type for the next chunk; array sub-records may override it
/// transiently.
pub fn parse_chunk(chunk: &Value, current: SegmentKind) -> (SegmentKind, Vec<Segment>, bool) {
    let mut current = current;
    if let Some(p) = chunk.get("p").and_then(Value::as_str) {
        match p {
            "response/search_status" | "response/status" => return (current, Vec::new(), false),
            "response/thinking_content" => current = SegmentKind::Thinking,
            "response/content" => current = SegmentKind::Text,
            _ => {}
        }
    }

    let mut segments = Vec::new();
    let mut finished = false;
    match chunk.get("v") {
        Some(Value::String(text)) => segments.push(Segment {
            kind: current,
            text: text.clone(),
        }),
        Some(Value::Array(items)) => {
            let mut kind = current;
            for item in items {
                if let Some(p) = item.get("p").and_then(Value::as_str) {
                    match p {
                        "status" => {
                            if item.get("v").and_then(Value::as_str) == Some("FINISHED") {
                                finished = true;
                            }
                            continue;
                        }
                        "response/search_status" | "response/status" => continue,
                        "response/thinking_content" | "thinking_content" => {
                            kind = SegmentKind::Thinking
                        }
                        "response/content" | "content" => kind = SegmentKind::Text,
                        _ => {}
                    }
                }
                if let Some(text) = item.get("v").and_then(Value::as_str) {
                    segments.push(Segment {
                        kind,
                        text: text.to_string(),
                    });
                }
            }
        }
        _ => {}
    }
    (current, segments, finished)
}
