use std::time::Duration;

use serde_json::Value;

use crate::sse::{parse_chunk, DataLines, SegmentKind};

pub const MAX_RETRIES: usize = 5;
const RETRY_DELAY: Duration = Duration::from_millis(800);

/// Linear backoff: 800ms × (attempt + 1).
pub fn retry_delay(attempt: usize) -> Duration {
    RETRY_DELAY * (attempt as u32 + 1)
}

/// Result of draining one upstream completion stream.
#[derive(Debug, Default)]
pub struct StreamCollect {
    pub text: String,
    pub thinking: String,
    /// At least one `data:` line arrived. When false the caller falls back
    /// to the JSON completion endpoint.
    pub saw_data: bool,
    /// The FINISHED status marker was observed.
    pub finished: bool,
}

impl StreamCollect {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty()
    }
}

/// Drain an SSE completion response into accumulated text and thinking.
/// `keep_thinking` gates the thinking channel; `drop_citations` suppresses
/// segments that start with a citation marker (search models).
pub async fn collect_stream(
    resp: reqwest::Response,
    keep_thinking: bool,
    drop_citations: bool,
) -> StreamCollect {
    let mut out = StreamCollect::default();
    let mut lines = DataLines::new(resp.bytes_stream());
    let mut current = SegmentKind::Text;
    while let Some(data) = lines.next().await {
        out.saw_data = true;
        let Ok(chunk) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        let (next, segments, finished) = parse_chunk(&chunk, current);
        current = next;
        for segment in segments {
            if drop_citations && segment.text.starts_with("[citation:") {
                continue;
            }
            match segment.kind {
                SegmentKind::Thinking => {
                    if keep_thinking {
                        out.thinking.push_str(&segment.text);
                    }
                }
                SegmentKind::Text => out.text.push_str(&segment.text),
            }
        }
        if finished {
            out.finished = true;
            break;
        }
    }
    out
}

/// Pull `(thinking, text)` out of a JSON completion body, accepting both the
/// OpenAI-style `choices` shape and the upstream's `data.biz_data.choices`
/// nesting. `None` when the body carries a non-zero error code or no usable
/// message.
pub fn extract_completion_from_json(body: &Value) -> Option<(String, String)> {
    if let Some(code) = body["code"].as_i64() {
        if code != 0 {
            return None;
        }
    }
    if let Some(choices) = body["choices"].as_array() {
        if !choices.is_empty() {
            let message = &choices[0]["message"];
            return Some((
                message["reasoning_content"].as_str().unwrap_or("").to_string(),
                message["content"].as_str().unwrap_or("").to_string(),
            ));
        }
    }
    let choices = body["data"]["biz_data"]["choices"].as_array()?;
    let message = choices.first()?.get("message")?;
    if message.is_null() {
        return None;
    }
    Some((
        message["reasoning_content"].as_str().unwrap_or("").to_string(),
        message["content"].as_str().unwrap_or("").to_string(),
    ))
}
