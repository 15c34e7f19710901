use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reqwest::header::HeaderValue;
use serde_json::json;

use crate::auth::{auth_headers, determine_mode_and_token, switch_account};
use crate::dialect::openai::{self, ChatCompletionRequest};
use crate::dialect::{messages_prepare, new_client_stream_id, resolve_model_flags};
use crate::error::AppError;
use crate::state::AppState;
use crate::util::now_unix;

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = state.get_config();
    let mut ctx = match determine_mode_and_token(&headers, &cfg, state.pool()).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(_) => return AppError::BadRequest("Invalid JSON body.".to_string()).into_response(),
    };
    if req.model.is_empty() || req.messages.is_empty() {
        return AppError::BadRequest("Request must include 'model' and 'messages'.".to_string())
            .into_response();
    }
    let Some(flags) = resolve_model_flags(&req.model) else {
        return AppError::Unavailable(format!("Model '{}' is not available.", req.model))
            .into_response();
    };

    tracing::info!(
        handler = "chat_completions",
        model = %req.model,
        messages = req.messages.len(),
        stream = req.stream,
        pool = ctx.use_pool,
        "Handler: POST /v1/chat/completions"
    );

    let final_prompt = messages_prepare(&req.messages);
    let ds = state.deepseek().clone();
    let mut upstream_headers = auth_headers(&cfg, &ctx);

    let mut session_id = ds.create_session(&upstream_headers, 3).await.ok();
    if session_id.is_none() && ctx.use_pool && switch_account(&mut ctx, state.pool()).await {
        upstream_headers = auth_headers(&cfg, &ctx);
        session_id = ds.create_session(&upstream_headers, 3).await.ok();
    }
    let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
        return AppError::Unauthorized("invalid token.".to_string()).into_response();
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
        return AppError::Unauthorized(
            "Failed to get PoW (invalid token or unknown error).".to_string(),
        )
        .into_response();
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
    let created = now_unix();
    let completion_id = session_id;

    if req.stream {
        return openai::stream_response(
            ds,
            ctx,
            upstream_headers,
            payload,
            req.model,
            final_prompt,
            completion_id,
            created,
            flags.thinking,
            flags.search,
        );
    }
    let (status, out) = openai::json_response(
        &ds,
        &upstream_headers,
        &payload,
        &req.model,
        &final_prompt,
        &completion_id,
        created,
        flags.thinking,
        flags.search,
    )
    .await;
    (status, Json(out)).into_response()
}
