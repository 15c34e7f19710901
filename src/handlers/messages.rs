use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::header::HeaderValue;
use serde_json::{json, Value};

use crate::auth::{auth_headers, determine_mode_and_token, switch_account};
use crate::dialect::claude::{self, MessagesRequest};
use crate::dialect::{messages_prepare, new_client_stream_id, resolve_model_flags, ChatMessage};
use crate::error::AppError;
use crate::state::AppState;

fn claude_error(err: AppError) -> Response {
    let status = err.status();
    tracing::warn!(status = status.as_u16(), error = %err, "Responding with error");
    (
        status,
        Json(claude::error_body("invalid_request_error", err.message())),
    )
        .into_response()
}

/// POST /anthropic/v1/messages
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = state.get_config();
    let mut ctx = match determine_mode_and_token(&headers, &cfg, state.pool()).await {
        Ok(ctx) => ctx,
        Err(e) => return claude_error(e),
    };

    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return claude_error(AppError::BadRequest("Invalid JSON body.".to_string())),
    };
    if req.model.is_empty() || req.messages.is_empty() {
        return claude_error(AppError::BadRequest(
            "Request must include 'model' and 'messages'.".to_string(),
        ));
    }

    let normalized = claude::normalize_messages(&req.messages);
    let mut payload_messages: Vec<ChatMessage> = Vec::with_capacity(normalized.len() + 2);
    if let Some(system) = claude::parse_system_message(req.system.as_ref()) {
        payload_messages.push(system);
    }
    payload_messages.extend(normalized.iter().cloned());
    if !req.tools.is_empty() && !claude::has_system_role(&payload_messages) {
        payload_messages.insert(0, claude::build_tool_system_message(&req.tools));
    }

    let deepseek_model = claude::map_model(&cfg.claude_model_mapping, &req.model);
    let flags = resolve_model_flags(&deepseek_model).unwrap_or_default();
    let final_prompt = messages_prepare(&payload_messages);

    tracing::info!(
        handler = "messages",
        model = %req.model,
        upstream_model = %deepseek_model,
        messages = req.messages.len(),
        tools = req.tools.len(),
        stream = req.stream,
        pool = ctx.use_pool,
        "Handler: POST /anthropic/v1/messages"
    );

    let ds = state.deepseek().clone();
    let mut upstream_headers = auth_headers(&cfg, &ctx);

    let mut session_id = ds.create_session(&upstream_headers, 3).await.ok();
    if session_id.is_none() && ctx.use_pool && switch_account(&mut ctx, state.pool()).await {
        upstream_headers = auth_headers(&cfg, &ctx);
        session_id = ds.create_session(&upstream_headers, 3).await.ok();
    }
    let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
        return claude_error(AppError::Unauthorized("invalid token.".to_string()));
    };

    let mut pow_response = ds
        .get_pow(&upstream_headers, state.solver(), state.pow_cache(), 3)
        .await
        .ok();
    if pow_response.is_none() && ctx.use_pool && switch_account(&mut ctx, state.pool()).await {
        upstream_headers = auth_headers(&cfg, &ctx);
        pow_response = ds
            .get_pow(&upstream_headers, state.solver(), state.pow_cache(), 3)
            .await
            .ok();
    }
    let Some(pow_response) = pow_response.filter(|p| !p.is_empty()) else {
        return claude_error(AppError::Unauthorized("Failed to get PoW.".to_string()));
    };
    if let Ok(value) = HeaderValue::from_str(&pow_response) {
        upstream_headers.insert("x-ds-pow-response", value);
    }

    let payload = json!({
        "chat_session_id": session_id,
        "parent_message_id": null,
        "client_stream_id": new_client_stream_id(),
        "prompt": final_prompt,
        "ref_file_ids": [],
        "thinking_enabled": flags.thinking,
        "search_enabled": flags.search,
    });

    if req.stream {
        return claude::stream_response(
            ds,
            ctx,
            upstream_headers,
            payload,
            req.model,
            normalized,
            req.tools,
        );
    }
    let (status, out) = claude::json_response(
        &ds,
        &upstream_headers,
        &payload,
        &req.model,
        &normalized,
        &req.tools,
    )
    .await;
    (status, Json(out)).into_response()
}

/// POST /anthropic/v1/messages/count_tokens
pub async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = state.get_config();
    let _ctx = match determine_mode_and_token(&headers, &cfg, state.pool()).await {
        Ok(ctx) => ctx,
        Err(e) => return claude_error(e),
    };

    let req: Value = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return claude_error(AppError::BadRequest("Invalid JSON body.".to_string())),
    };
    let model = req["model"].as_str().unwrap_or("");
    let messages: Vec<ChatMessage> = req["messages"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|m| ChatMessage {
                    role: m.get("role").and_then(Value::as_str).unwrap_or("").to_string(),
                    content: m.get("content").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default();
    if model.is_empty() || messages.is_empty() {
        return claude_error(AppError::BadRequest(
            "Request must include 'model' and 'messages'.".to_string(),
        ));
    }

    let count = (messages_prepare(&messages).len() / 4).max(1);
    (StatusCode::OK, Json(json!({"input_tokens": count}))).into_response()
}
