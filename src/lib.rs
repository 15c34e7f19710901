pub mod auth;
pub mod cloudsync;
pub mod config;
pub mod dialect;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod pool;
pub mod pow;
pub mod sse;
pub mod state;
pub mod upstream;
pub mod util;

use axum::routing::{get, post};
use axum::Router;

pub use state::AppState;

fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::root::landing))
        .route("/pool/status", get(handlers::status::pool_status))
        .route("/sync/status", get(handlers::status::sync_status))
}

fn model_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(handlers::models::openai_models))
        .route(
            "/anthropic/v1/models",
            get(handlers::models::anthropic_models),
        )
}

fn completion_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat::chat_completions))
        .route("/anthropic/v1/messages", post(handlers::messages::messages))
        .route(
            "/anthropic/v1/messages/count_tokens",
            post(handlers::messages::count_tokens),
        )
}

/// Build the full application router (used by main and tests).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(status_routes())
        .merge(model_routes())
        .merge(completion_routes())
        .with_state(state)
}
