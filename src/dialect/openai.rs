use async_stream::stream;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{estimate_tokens, ChatMessage};
use crate::auth::AuthContext;
use crate::pipeline::{
    collect_stream, extract_completion_from_json, retry_delay, MAX_RETRIES,
};
use crate::sse::{parse_chunk, DataLines, SegmentKind};
use crate::upstream::DeepSeekClient;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

fn sse_frame(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

fn sse_raw(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

fn chunk_event(completion_id: &str, created: i64, model: &str, delta: Value) -> Value {
    json!({
        "id": completion_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{"delta": delta, "index": 0}],
    })
}

fn usage_block(prompt_tokens: usize, reasoning_tokens: usize, completion_tokens: usize) -> Value {
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": reasoning_tokens + completion_tokens,
        "total_tokens": prompt_tokens + reasoning_tokens + completion_tokens,
        "completion_tokens_details": {"reasoning_tokens": reasoning_tokens},
    })
}

/// Streaming chat completion: emits `chat.completion.chunk` deltas as the
/// upstream segments arrive, with the JSON fallback and retry policy applied
/// between attempts. The auth context rides inside the generator so the pool
/// slot is held until the stream is dropped.
#[allow(clippy::too_many_arguments)]
pub fn stream_response(
    ds: DeepSeekClient,
    ctx: AuthContext,
    headers: HeaderMap,
    payload: Value,
    model: String,
    final_prompt: String,
    completion_id: String,
    created: i64,
    thinking_enabled: bool,
    search_enabled: bool,
) -> Response {
    let body = stream! {
        let _ctx = ctx;
        for attempt in 0..=MAX_RETRIES {
            let resp = match ds.completion_raw_stream_request(&headers, &payload).await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    tracing::warn!(error = %e, "completion stream failed after retries");
                    yield Ok::<_, std::convert::Infallible>(sse_raw(
                        r#"{"error":"Upstream connection failed after retries"}"#,
                    ));
                    yield Ok(sse_raw("[DONE]"));
                    return;
                }
            };

            let mut final_text = String::new();
            let mut final_thinking = String::new();
            let mut first_chunk = false;
            let mut saw_data = false;
            let mut retry_now = false;

            let mut lines = DataLines::new(resp.bytes_stream());
            let mut current = SegmentKind::Text;
            while let Some(data) = lines.next().await {
                saw_data = true;
                let Ok(parsed) = serde_json::from_str::<Value>(&data) else {
                    continue;
                };
                let (next, segments, finished) = parse_chunk(&parsed, current);
                current = next;
                for segment in segments {
                    let text = segment.text;
                    if search_enabled && text.starts_with("[citation:") {
                        continue;
                    }
                    let mut delta = Map::new();
                    if !first_chunk {
                        delta.insert("role".to_string(), json!("assistant"));
                        first_chunk = true;
                    }
                    match segment.kind {
                        SegmentKind::Thinking => {
                            if thinking_enabled {
                                final_thinking.push_str(&text);
                                delta.insert("reasoning_content".to_string(), json!(text));
                            }
                        }
                        SegmentKind::Text => {
                            final_text.push_str(&text);
                            delta.insert("content".to_string(), json!(text));
                        }
                    }
                    if !delta.is_empty() {
                        let event =
                            chunk_event(&completion_id, created, &model, Value::Object(delta));
                        yield Ok(sse_frame(&event));
                    }
                }
                if finished {
                    if !first_chunk
                        && final_text.is_empty()
                        && final_thinking.is_empty()
                        && attempt < MAX_RETRIES
                    {
                        retry_now = true;
                    }
                    break;
                }
            }

            if retry_now {
                tokio::time::sleep(retry_delay(attempt)).await;
                continue;
            }
            if !saw_data {
                if let Ok(body) = ds.completion_json_request(&headers, &payload).await {
                    if let Some((json_thinking, json_text)) = extract_completion_from_json(&body) {
                        final_text = json_text;
                        if thinking_enabled {
                            final_thinking = json_thinking;
                        }
                        if !first_chunk {
                            let mut delta = Map::new();
                            delta.insert("role".to_string(), json!("assistant"));
                            if !final_text.is_empty() {
                                delta.insert("content".to_string(), json!(final_text));
                            }
                            if !final_thinking.is_empty() {
                                delta.insert("reasoning_content".to_string(), json!(final_thinking));
                            }
                            let event =
                                chunk_event(&completion_id, created, &model, Value::Object(delta));
                            yield Ok(sse_frame(&event));
                            first_chunk = true;
                        }
                    }
                }
                if !first_chunk && final_text.is_empty() && final_thinking.is_empty() {
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    yield Ok(sse_raw(r#"{"error":"Invalid upstream stream"}"#));
                    yield Ok(sse_raw("[DONE]"));
                    return;
                }
            }
            if !first_chunk
                && final_text.is_empty()
                && final_thinking.is_empty()
                && attempt < MAX_RETRIES
            {
                tokio::time::sleep(retry_delay(attempt)).await;
                continue;
            }
            if !saw_data && !first_chunk {
                yield Ok(sse_raw(r#"{"error":"Invalid upstream stream"}"#));
                yield Ok(sse_raw("[DONE]"));
                return;
            }

            let prompt_tokens = estimate_tokens(&final_prompt);
            let reasoning_tokens = estimate_tokens(&final_thinking);
            let completion_tokens = estimate_tokens(&final_text);
            let finish = json!({
                "id": completion_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{"delta": {}, "index": 0, "finish_reason": "stop"}],
                "usage": usage_block(prompt_tokens, reasoning_tokens, completion_tokens),
            });
            yield Ok(sse_frame(&finish));
            yield Ok(sse_raw("[DONE]"));
            return;
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

/// Non-streaming chat completion: drain the upstream stream (or the JSON
/// fallback) and assemble one `chat.completion` object.
#[allow(clippy::too_many_arguments)]
pub async fn json_response(
    ds: &DeepSeekClient,
    headers: &HeaderMap,
    payload: &Value,
    model: &str,
    final_prompt: &str,
    completion_id: &str,
    created: i64,
    thinking_enabled: bool,
    search_enabled: bool,
) -> (StatusCode, Value) {
    for attempt in 0..=MAX_RETRIES {
        let mut final_text = String::new();
        let mut final_thinking = String::new();

        match ds.completion_raw_stream_request(headers, payload).await {
            Err(e) => {
                if let Ok(body) = ds.completion_json_request(headers, payload).await {
                    if let Some((json_thinking, json_text)) = extract_completion_from_json(&body) {
                        final_text = json_text;
                        final_thinking = json_thinking;
                    }
                }
                if !final_text.is_empty() || !final_thinking.is_empty() {
                    return (
                        StatusCode::OK,
                        completion_object(
                            completion_id,
                            created,
                            model,
                            final_prompt,
                            &final_thinking,
                            &final_text,
                        ),
                    );
                }
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(retry_delay(attempt)).await;
                    continue;
                }
                tracing::warn!(error = %e, "completion failed after retries");
                return (
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "Upstream DeepSeek completion failed after retries."}),
                );
            }
            Ok(resp) => {
                let collected = collect_stream(resp, thinking_enabled, search_enabled).await;
                final_text = collected.text;
                final_thinking = collected.thinking;

                if collected.finished
                    && final_text.is_empty()
                    && final_thinking.is_empty()
                    && attempt < MAX_RETRIES
                {
                    tokio::time::sleep(retry_delay(attempt)).await;
                    continue;
                }
                if !collected.saw_data {
                    if let Ok(body) = ds.completion_json_request(headers, payload).await {
                        if let Some((json_thinking, json_text)) =
                            extract_completion_from_json(&body)
                        {
                            final_text = json_text;
                            final_thinking = json_thinking;
                        }
                    }
                    if final_text.is_empty() && final_thinking.is_empty() {
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(retry_delay(attempt)).await;
                            continue;
                        }
                        return (
                            StatusCode::BAD_GATEWAY,
                            json!({"error": "Upstream DeepSeek returned an invalid completion stream."}),
                        );
                    }
                }
                if final_text.is_empty() && final_thinking.is_empty() && attempt < MAX_RETRIES {
                    tokio::time::sleep(retry_delay(attempt)).await;
                    continue;
                }

                return (
                    StatusCode::OK,
                    completion_object(
                        completion_id,
                        created,
                        model,
                        final_prompt,
                        &final_thinking,
                        &final_text,
                    ),
                );
            }
        }
    }
    (
        StatusCode::BAD_GATEWAY,
        json!({"error": "Upstream DeepSeek completion failed after retries."}),
    )
}

fn completion_object(
    completion_id: &str,
    created: i64,
    model: &str,
    final_prompt: &str,
    final_thinking: &str,
    final_text: &str,
) -> Value {
    let prompt_tokens = estimate_tokens(final_prompt);
    let reasoning_tokens = estimate_tokens(final_thinking);
    let completion_tokens = estimate_tokens(final_text);
    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": final_text,
                "reasoning_content": final_thinking,
            },
            "finish_reason": "stop",
        }],
        "usage": usage_block(prompt_tokens, reasoning_tokens, completion_tokens),
    })
}
