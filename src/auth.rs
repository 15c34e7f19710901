use std::collections::HashSet;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::config::Config;
use crate::error::AppError;
use crate::pool::{AccountGuard, Pool};
use crate::upstream::header_map;
use crate::util::key_prefix;

const OA_KEY_HEADER: &str = "x-oa-key";

/// Per-request authentication state. `use_pool` requests carry a scoped
/// account guard; passthrough requests forward the caller's key as the
/// upstream bearer. `failed` collects account ids already burned by this
/// request so a switchover picks someone else.
#[derive(Debug)]
pub struct AuthContext {
    pub use_pool: bool,
    pub caller_key: String,
    pub token: String,
    pub account: Option<AccountGuard>,
    pub failed: HashSet<String>,
}

/// Resolve the caller's key (`X-OA-Key` or `Authorization: Bearer`) into
/// either a pool-backed context or a passthrough one.
pub async fn determine_mode_and_token(
    headers: &HeaderMap,
    cfg: &Config,
    pool: &Arc<Pool>,
) -> Result<AuthContext, AppError> {
    let mut caller_key = headers
        .get(OA_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if caller_key.is_empty() {
        if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            let auth = auth.trim();
            if auth.len() >= 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
                caller_key = auth[7..].trim().to_string();
            }
        }
    }
    if caller_key.is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: missing X-OA-Key or Authorization Bearer header.".to_string(),
        ));
    }

    if !cfg.keys.iter().any(|k| *k == caller_key) {
        tracing::debug!(caller = %key_prefix(&caller_key), "auth: passthrough mode");
        return Ok(AuthContext {
            use_pool: false,
            token: caller_key.clone(),
            caller_key,
            account: None,
            failed: HashSet::new(),
        });
    }

    let Some(mut guard) = pool.acquire(&HashSet::new()) else {
        return Err(AppError::Unavailable(
            "No accounts available in pool.".to_string(),
        ));
    };
    if let Err(e) = pool.ensure_token(&mut guard.account).await {
        tracing::warn!(account = %key_prefix(&guard.id()), error = %e, "auth: account login failed");
        drop(guard);
        return Err(AppError::Internal("Account login failed.".to_string()));
    }
    tracing::debug!(account = %key_prefix(&guard.id()), "auth: pool mode");
    let token = guard.account.token.trim().to_string();
    Ok(AuthContext {
        use_pool: true,
        caller_key,
        token,
        account: Some(guard),
        failed: HashSet::new(),
    })
}

/// Base upstream header set plus the bearer for this request.
pub fn auth_headers(cfg: &Config, ctx: &AuthContext) -> HeaderMap {
    let mut headers = header_map(&cfg.base_headers());
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", ctx.token)) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}

/// Swap the bound account for a different one: record the current id as
/// failed, release it, acquire excluding the failed set and log the new
/// account in. `false` when no replacement could be readied.
pub async fn switch_account(ctx: &mut AuthContext, pool: &Arc<Pool>) -> bool {
    if !ctx.use_pool {
        return false;
    }
    if let Some(guard) = ctx.account.take() {
        ctx.failed.insert(guard.id());
        drop(guard);
    }
    let Some(mut guard) = pool.acquire(&ctx.failed) else {
        ctx.token.clear();
        return false;
    };
    if pool.ensure_token(&mut guard.account).await.is_err() {
        ctx.token.clear();
        return false;
    }
    tracing::info!(account = %key_prefix(&guard.id()), "switched account");
    ctx.token = guard.account.token.trim().to_string();
    ctx.account = Some(guard);
    true
}
