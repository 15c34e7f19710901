use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

const MODEL_CREATED: i64 = 1715635200;

/// GET /v1/models — the fixed OpenAI-compatible list.
pub async fn openai_models() -> impl IntoResponse {
    let ids = [
        "deepseek-chat",
        "deepseek-v3",
        "deepseek-r1",
        "deepseek-reasoner",
        "deepseek-v3-search",
        "deepseek-chat-search",
        "deepseek-r1-search",
        "deepseek-reasoner-search",
    ];
    let data: Vec<_> = ids
        .iter()
        .map(|id| json!({"id": id, "object": "model", "created": MODEL_CREATED, "owned_by": "deepseek"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// GET /anthropic/v1/models — the fixed Claude-compatible list.
pub async fn anthropic_models() -> impl IntoResponse {
    let ids = ["claude-sonnet-4-20250514", "claude-opus-4-20250514"];
    let data: Vec<_> = ids
        .iter()
        .map(|id| json!({"id": id, "object": "model", "created": MODEL_CREATED, "owned_by": "anthropic"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}
