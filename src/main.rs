use std::sync::Arc;
use std::time::Duration;

use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{self, TraceLayer};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use deepseek_gateway::cloudsync::{SyncClient, SyncManager};
use deepseek_gateway::config::Config;
use deepseek_gateway::pool::Pool;
use deepseek_gateway::pow::{AnswerCache, PowSolver};
use deepseek_gateway::upstream::DeepSeekClient;
use deepseek_gateway::{build_app, AppState};

/// Shared outbound client. The timeout floor is load-bearing: reasoning
/// completions routinely run for minutes.
fn build_http_client(cfg: &Config) -> reqwest::Client {
    let timeout_secs = cfg.request_timeout_secs.max(120);
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .cookie_store(true)
        .build()
        .expect("Failed to build HTTP client")
}

#[tokio::main]
async fn main() {
    let cfg = Config::load();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    let http = build_http_client(&cfg);
    let pool = Pool::new(&cfg, http.clone());
    let solver = Arc::new(PowSolver::new(&cfg.pow_solver, &cfg.pow_wasm_path));
    if let Err(e) = solver.warmup() {
        tracing::warn!(error = %e, "PoW solver warmup failed");
    }
    let deepseek = DeepSeekClient::new(
        http.clone(),
        cfg.url_session(),
        cfg.url_create_pow(),
        cfg.url_completion(),
    );

    let port = cfg.port;
    let cloud_sync = cfg.cloud_sync.clone();
    let state = AppState::new(cfg, http.clone(), pool, solver, AnswerCache::new(), deepseek);

    let mut sync_task = None;
    if cloud_sync.enabled {
        if cloud_sync.base_url.is_empty() {
            tracing::warn!("cloudsync enabled but base_url is empty");
            state.mark_sync_error("cloudsync base_url is empty");
        } else {
            let client = SyncClient::new(
                http.clone(),
                &cloud_sync.base_url,
                &cloud_sync.token,
                &cloud_sync.user_id,
            );
            let manager = Arc::new(SyncManager::new(state.clone(), client, cloud_sync));
            if let Err(e) = manager.initial_sync().await {
                tracing::warn!(error = %e, "cloudsync initial sync failed");
            }
            let runner = Arc::clone(&manager);
            sync_task = Some(tokio::spawn(async move { runner.run().await }));
        }
    }

    let app = build_app(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_request(trace::DefaultOnRequest::new().level(Level::INFO))
                .on_response(
                    trace::DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(tower_http::LatencyUnit::Millis),
                ),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .layer(CatchPanicLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods(AllowMethods::any())
                .allow_headers(AllowHeaders::any()),
        );

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    if let Some(task) = sync_task {
        task.abort();
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down...");
}
