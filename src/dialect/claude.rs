use std::collections::HashMap;

use async_stream::stream;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::Rng;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{estimate_tokens, ChatMessage};
use crate::auth::AuthContext;
use crate::pipeline::{collect_stream, extract_completion_from_json, retry_delay, MAX_RETRIES};
use crate::upstream::DeepSeekClient;
use crate::util::now_unix;

const EMPTY_RESPONSE_TEXT: &str = "抱歉，没有生成有效的响应内容。";

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
}

/// Anthropic-shaped error body.
pub fn error_body(error_type: &str, message: &str) -> Value {
    json!({"error": {"type": error_type, "message": message}})
}

/// Route a Claude model name through the runtime mapping: opus/reasoner/slow
/// names use the `slow` entry, everything else the `fast` entry; an empty
/// entry falls back to `deepseek-chat`.
pub fn map_model(mapping: &HashMap<String, String>, model: &str) -> String {
    let lowered = model.to_lowercase();
    let key = if lowered.contains("opus") || lowered.contains("reasoner") || lowered.contains("slow")
    {
        "slow"
    } else {
        "fast"
    };
    match mapping.get(key) {
        Some(v) if !v.trim().is_empty() => v.clone(),
        _ => "deepseek-chat".to_string(),
    }
}

/// Flatten a Claude content value: strings pass through, block arrays join
/// their text / tool_result parts with newlines. An array that contributed
/// nothing usable is passed through untouched.
pub fn normalize_content(content: &Value) -> Value {
    let Some(items) = content.as_array() else {
        return content.clone();
    };
    let mut parts = Vec::with_capacity(items.len());
    for block in items {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    parts.push(t.to_string());
                }
            }
            Some("tool_result") => {
                if let Some(c) = block.get("content") {
                    parts.push(c.to_string());
                }
            }
            _ => {}
        }
    }
    if !parts.is_empty() {
        return Value::String(parts.join("\n"));
    }
    if !items.is_empty() {
        return content.clone();
    }
    Value::String(String::new())
}

pub fn normalize_messages(messages: &[Value]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.get("role").and_then(Value::as_str).unwrap_or("").to_string(),
            content: normalize_content(m.get("content").unwrap_or(&Value::Null)),
        })
        .collect()
}

/// Turn a non-empty `system` value (string or content array) into a
/// synthetic system message.
pub fn parse_system_message(system: Option<&Value>) -> Option<ChatMessage> {
    let normalized = normalize_content(system?);
    match normalized.as_str() {
        Some(text) if !text.trim().is_empty() => Some(ChatMessage {
            role: "system".to_string(),
            content: Value::String(text.to_string()),
        }),
        _ => None,
    }
}

pub fn has_system_role(messages: &[ChatMessage]) -> bool {
    messages.iter().any(|m| m.role.eq_ignore_ascii_case("system"))
}

/// Instruction block prepended when tools are requested without a system
/// message: lists the tools and pins the exact JSON reply shape that
/// `detect_tool_calls` expects.
pub fn build_tool_system_message(tools: &[Value]) -> ChatMessage {
    let infos: Vec<String> = tools
        .iter()
        .map(|t| {
            let name = t
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or("unknown");
            let description = t
                .get("description")
                .and_then(Value::as_str)
                .filter(|d| !d.trim().is_empty())
                .unwrap_or("No description available");
            format!("Tool: {name}\nDescription: {description}")
        })
        .collect();
    let content = format!(
        "You are Claude, a helpful AI assistant. You have access to these tools:\n\n{}\n\nWhen you need to use tools, output ONLY valid JSON in this format:\n{{\"tool_calls\": [{{\"name\": \"tool_name\", \"input\": {{\"param\": \"value\"}}}}]}}\n\nYou can call multiple tools in ONE response by including them in the same tool_calls array.\nDo not include any text outside the JSON structure.",
        infos.join("\n\n")
    );
    ChatMessage {
        role: "system".to_string(),
        content: Value::String(content),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedToolCall {
    pub name: String,
    pub input: Value,
}

/// Strict tool-call extraction: the text must begin with the literal
/// `{"tool_calls":` prefix and end with `]}`; entries naming undeclared
/// tools are dropped. The model is instructed to emit exactly this shape,
/// so anything looser is treated as plain text.
pub fn detect_tool_calls(text: &str, tools: &[Value]) -> Vec<DetectedToolCall> {
    let clean = text.trim();
    if !clean.starts_with("{\"tool_calls\":") || !clean.ends_with("]}") {
        return Vec::new();
    }
    let Ok(body) = serde_json::from_str::<Value>(clean) else {
        return Vec::new();
    };
    let Some(calls) = body.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    let allowed: Vec<&str> = tools
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .collect();
    calls
        .iter()
        .filter_map(|call| {
            let name = call.get("name").and_then(Value::as_str)?;
            if !allowed.contains(&name) {
                return None;
            }
            Some(DetectedToolCall {
                name: name.to_string(),
                input: call.get("input").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

fn message_id() -> String {
    format!(
        "msg_{}_{}",
        now_unix(),
        rand::thread_rng().gen_range(1000..10000)
    )
}

fn sse_frame(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Streaming messages endpoint. The upstream is drained fully first (the
/// prompt-embedded tool protocol needs the complete text before tool calls
/// can be detected), then the Anthropic event sequence is replayed to the
/// client.
#[allow(clippy::too_many_arguments)]
pub fn stream_response(
    ds: DeepSeekClient,
    ctx: AuthContext,
    headers: HeaderMap,
    payload: Value,
    model: String,
    messages: Vec<ChatMessage>,
    tools: Vec<Value>,
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
                    let event = json!({"type": "error", "error": {
                        "type": "api_error",
                        "message": format!("Stream processing error: {e}"),
                    }});
                    yield Ok::<_, std::convert::Infallible>(sse_frame(&event));
                    return;
                }
            };

            let collected = collect_stream(resp, true, false).await;
            let mut final_text = collected.text;
            let mut final_thinking = collected.thinking;

            if !collected.saw_data {
                if let Ok(body) = ds.completion_json_request(&headers, &payload).await {
                    if let Some((json_thinking, json_text)) = extract_completion_from_json(&body) {
                        final_text = json_text;
                        final_thinking = json_thinking;
                    }
                }
                if final_text.is_empty() && final_thinking.is_empty() {
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    let event = json!({"type": "error", "error": {
                        "type": "api_error",
                        "message": "Invalid upstream stream.",
                    }});
                    yield Ok(sse_frame(&event));
                    return;
                }
            }
            if final_text.is_empty() && final_thinking.is_empty() && attempt < MAX_RETRIES {
                tokio::time::sleep(retry_delay(attempt)).await;
                continue;
            }

            let input_tokens = estimate_tokens(&serde_json::to_string(&messages).unwrap_or_default());
            let start = json!({"type": "message_start", "message": {
                "id": message_id(),
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": input_tokens, "output_tokens": 0},
            }});
            yield Ok(sse_frame(&start));

            let detected = detect_tool_calls(&final_text, &tools);
            let mut output_tokens = 0usize;
            let mut content_index = 0usize;

            if !final_thinking.is_empty() {
                yield Ok(sse_frame(&json!({"type": "content_block_start", "index": content_index,
                    "content_block": {"type": "thinking", "thinking": ""}})));
                yield Ok(sse_frame(&json!({"type": "content_block_delta", "index": content_index,
                    "delta": {"type": "thinking_delta", "thinking": final_thinking}})));
                yield Ok(sse_frame(&json!({"type": "content_block_stop", "index": content_index})));
                output_tokens += estimate_tokens(&final_thinking);
                content_index += 1;
            }

            if !detected.is_empty() {
                for (i, call) in detected.iter().enumerate() {
                    let index = content_index + i;
                    let id = format!(
                        "toolu_{}_{}_{}",
                        now_unix(),
                        rand::thread_rng().gen_range(1000..10000),
                        index
                    );
                    yield Ok(sse_frame(&json!({"type": "content_block_start", "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": call.name, "input": call.input}})));
                    yield Ok(sse_frame(&json!({"type": "content_block_stop", "index": index})));
                    output_tokens += estimate_tokens(&call.input.to_string());
                }
                yield Ok(sse_frame(&json!({"type": "message_delta",
                    "delta": {"stop_reason": "tool_use", "stop_sequence": null},
                    "usage": {"output_tokens": output_tokens}})));
            } else {
                if !final_text.is_empty() {
                    yield Ok(sse_frame(&json!({"type": "content_block_start", "index": content_index,
                        "content_block": {"type": "text", "text": ""}})));
                    yield Ok(sse_frame(&json!({"type": "content_block_delta", "index": content_index,
                        "delta": {"type": "text_delta", "text": final_text}})));
                    yield Ok(sse_frame(&json!({"type": "content_block_stop", "index": content_index})));
                    output_tokens += estimate_tokens(&final_text);
                }
                yield Ok(sse_frame(&json!({"type": "message_delta",
                    "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                    "usage": {"output_tokens": output_tokens}})));
            }
            yield Ok(sse_frame(&json!({"type": "message_stop"})));
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

/// Non-streaming messages endpoint.
pub async fn json_response(
    ds: &DeepSeekClient,
    headers: &HeaderMap,
    payload: &Value,
    model: &str,
    messages: &[ChatMessage],
    tools: &[Value],
) -> (StatusCode, Value) {
    for attempt in 0..=MAX_RETRIES {
        let resp = match ds.completion_raw_stream_request(headers, payload).await {
            Ok(resp) => resp,
            Err(e) => {
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(retry_delay(attempt)).await;
                    continue;
                }
                tracing::warn!(error = %e, "claude completion failed after retries");
                return (
                    StatusCode::BAD_GATEWAY,
                    error_body("api_error", "Upstream DeepSeek completion failed."),
                );
            }
        };

        let collected = collect_stream(resp, true, false).await;
        let mut final_text = collected.text;
        let mut final_thinking = collected.thinking;

        if !collected.saw_data {
            if let Ok(body) = ds.completion_json_request(headers, payload).await {
                if let Some((json_thinking, json_text)) = extract_completion_from_json(&body) {
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
                    error_body("api_error", "Invalid upstream stream."),
                );
            }
        }
        if final_text.is_empty() && final_thinking.is_empty() && attempt < MAX_RETRIES {
            tokio::time::sleep(retry_delay(attempt)).await;
            continue;
        }

        let detected = detect_tool_calls(&final_text, tools);
        let mut content = Vec::new();
        if !final_thinking.is_empty() {
            content.push(json!({"type": "thinking", "thinking": final_thinking}));
        }
        if !detected.is_empty() {
            for (i, call) in detected.iter().enumerate() {
                let id = format!(
                    "toolu_{}_{}",
                    i + 1,
                    rand::thread_rng().gen_range(1000..10000)
                );
                content.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
        } else if !final_text.is_empty() || final_thinking.is_empty() {
            let text = if final_text.trim().is_empty() {
                EMPTY_RESPONSE_TEXT
            } else {
                final_text.as_str()
            };
            content.push(json!({"type": "text", "text": text}));
        }

        let input_tokens =
            estimate_tokens(&serde_json::to_string(messages).unwrap_or_default());
        let output_tokens = estimate_tokens(&final_text) + estimate_tokens(&final_thinking);
        let out = json!({
            "id": message_id(),
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": content,
            "stop_reason": if detected.is_empty() { "end_turn" } else { "tool_use" },
            "stop_sequence": null,
            "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
        });
        return (StatusCode::OK, out);
    }
    (
        StatusCode::BAD_GATEWAY,
        error_body("api_error", "Upstream DeepSeek completion failed."),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(fast: &str, slow: &str) -> HashMap<String, String> {
        HashMap::from([
            ("fast".to_string(), fast.to_string()),
            ("slow".to_string(), slow.to_string()),
        ])
    }

    #[test]
    fn opus_routes_slow_and_sonnet_routes_fast() {
        let mapping = mapping("deepseek-reasoner", "deepseek-chat");
        assert_eq!(
            map_model(&mapping, "claude-opus-4-20250514"),
            "deepseek-chat"
        );
        assert_eq!(
            map_model(&mapping, "claude-sonnet-4-20250514"),
            "deepseek-reasoner"
        );
    }

    #[test]
    fn empty_mapping_entries_fall_back() {
        let mapping = mapping("", "");
        assert_eq!(map_model(&mapping, "claude-opus-4"), "deepseek-chat");
        assert_eq!(map_model(&mapping, "claude-sonnet-4"), "deepseek-chat");
        assert_eq!(map_model(&HashMap::new(), "anything"), "deepseek-chat");
    }

    #[test]
    fn normalize_joins_text_and_tool_result_blocks() {
        let content = json!([
            {"type": "text", "text": "look at"},
            {"type": "tool_result", "content": {"status": "ok"}},
        ]);
        assert_eq!(
            normalize_content(&content),
            json!("look at\n{\"status\":\"ok\"}")
        );
    }

    #[test]
    fn normalize_passes_unusable_arrays_through() {
        let content = json!([{"type": "image", "source": {}}]);
        assert_eq!(normalize_content(&content), content);
        assert_eq!(normalize_content(&json!([])), json!(""));
        assert_eq!(normalize_content(&json!("plain")), json!("plain"));
    }

    #[test]
    fn system_string_becomes_a_system_message() {
        let msg = parse_system_message(Some(&json!("be brief"))).unwrap();
        assert_eq!(msg.role, "system");
        assert_eq!(msg.content, json!("be brief"));
        assert!(parse_system_message(Some(&json!("   "))).is_none());
        assert!(parse_system_message(None).is_none());
    }

    #[test]
    fn tool_system_message_lists_every_tool() {
        let tools = vec![
            json!({"name": "get_weather", "description": "Look up weather"}),
            json!({"name": "search"}),
        ];
        let msg = build_tool_system_message(&tools);
        let text = msg.content.as_str().unwrap();
        assert!(text.contains("Tool: get_weather\nDescription: Look up weather"));
        assert!(text.contains("Tool: search\nDescription: No description available"));
        assert!(text.contains(r#"{"tool_calls": [{"name": "tool_name", "input": {"param": "value"}}]}"#));
    }

    #[test]
    fn detects_declared_tool_calls() {
        let tools = vec![json!({"name": "get_weather"})];
        let text = r#"{"tool_calls": [{"name": "get_weather", "input": {"city": "Oslo"}}]}"#;
        let detected = detect_tool_calls(text, &tools);
        assert_eq!(
            detected,
            vec![DetectedToolCall {
                name: "get_weather".to_string(),
                input: json!({"city": "Oslo"}),
            }]
        );
    }

    #[test]
    fn undeclared_tools_are_dropped() {
        let tools = vec![json!({"name": "search"})];
        let text = r#"{"tool_calls": [{"name": "get_weather", "input": {}}]}"#;
        assert!(detect_tool_calls(text, &tools).is_empty());
    }

    #[test]
    fn loose_text_is_not_a_tool_call() {
        let tools = vec![json!({"name": "get_weather"})];
        assert!(detect_tool_calls("I would call get_weather", &tools).is_empty());
        assert!(detect_tool_calls(r#"{"tool_calls": "nope"}"#, &tools).is_empty());
        // Wrong suffix.
        assert!(detect_tool_calls(
            r#"{"tool_calls": [{"name": "get_weather"}], "extra": 1}"#,
            &tools
        )
        .is_empty());
    }

    #[test]
    fn detection_survives_surrounding_whitespace() {
        let tools = vec![json!({"name": "t"})];
        let text = "  {\"tool_calls\": [{\"name\": \"t\", \"input\": {}}]}\n";
        assert_eq!(detect_tool_calls(text, &tools).len(), 1);
    }
}
