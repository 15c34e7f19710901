use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

/// GET /pool/status
pub async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool().status())
}

/// GET /sync/status
pub async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sync_status())
}
