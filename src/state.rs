use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::Config;
use crate::pool::Pool;
use crate::pow::{AnswerCache, PowSolver};
use crate::upstream::DeepSeekClient;
use crate::util::now_unix;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub connected: bool,
    pub last_success_unix: i64,
    pub last_version: i64,
    pub last_cursor: i64,
    pub last_error: String,
}

struct Shared {
    cfg: Config,
    sync_status: SyncStatus,
}

struct Inner {
    shared: RwLock<Shared>,
    pool: Arc<Pool>,
    solver: Arc<PowSolver>,
    pow_cache: AnswerCache,
    deepseek: DeepSeekClient,
    http: reqwest::Client,
}

/// Process-wide shared state: the effective config snapshot, sync status and
/// the component handles. Cloning is cheap; reads deep-copy the config so no
/// mutable map is ever shared across requests.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    pub fn new(
        cfg: Config,
        http: reqwest::Client,
        pool: Arc<Pool>,
        solver: Arc<PowSolver>,
        pow_cache: AnswerCache,
        deepseek: DeepSeekClient,
    ) -> Self {
        let sync_status = SyncStatus {
            enabled: cfg.cloud_sync.enabled,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                shared: RwLock::new(Shared { cfg, sync_status }),
                pool,
                solver,
                pow_cache,
                deepseek,
                http,
            }),
        }
    }

    pub fn get_config(&self) -> Config {
        self.inner.shared.read().unwrap().cfg.clone()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    pub fn solver(&self) -> &Arc<PowSolver> {
        &self.inner.solver
    }

    pub fn pow_cache(&self) -> &AnswerCache {
        &self.inner.pow_cache
    }

    pub fn deepseek(&self) -> &DeepSeekClient {
        &self.inner.deepseek
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Write the cloud-synced runtime fields through to the config snapshot.
    pub fn update_sync_runtime(
        &self,
        refresh: bool,
        max_active_accounts: usize,
        mapping: HashMap<String, String>,
    ) {
        let mut shared = self.inner.shared.write().unwrap();
        shared.cfg.refresh = refresh;
        shared.cfg.max_active_accounts = max_active_accounts;
        shared.cfg.claude_model_mapping = mapping;
    }

    pub fn mark_sync_success(&self, version: i64, cursor: i64) {
        let mut shared = self.inner.shared.write().unwrap();
        shared.sync_status.connected = true;
        shared.sync_status.last_error.clear();
        shared.sync_status.last_version = version;
        shared.sync_status.last_cursor = cursor;
        shared.sync_status.last_success_unix = now_unix();
    }

    pub fn mark_sync_error(&self, error: &str) {
        let mut shared = self.inner.shared.write().unwrap();
        shared.sync_status.connected = false;
        shared.sync_status.last_error = error.to_string();
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.inner.shared.write().unwrap().sync_status.enabled = enabled;
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.shared.read().unwrap().sync_status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(cfg: Config) -> AppState {
        let http = reqwest::Client::new();
        let pool = Pool::new(&cfg, http.clone());
        let solver = Arc::new(PowSolver::new("native", ""));
        let deepseek = DeepSeekClient::new(
            http.clone(),
            cfg.url_session(),
            cfg.url_create_pow(),
            cfg.url_completion(),
        );
        AppState::new(cfg, http, pool, solver, AnswerCache::new(), deepseek)
    }

    #[test]
    fn config_reads_are_deep_copies() {
        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        cfg.claude_model_mapping =
            HashMap::from([("fast".to_string(), "deepseek-chat".to_string())]);
        let state = test_state(cfg);

        let mut copy = state.get_config();
        copy.claude_model_mapping
            .insert("fast".to_string(), "mutated".to_string());
        assert_eq!(state.get_config().claude_model_mapping["fast"], "deepseek-chat");
    }

    #[test]
    fn sync_status_transitions() {
        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        let state = test_state(cfg);

        state.mark_sync_error("boom");
        let status = state.sync_status();
        assert!(!status.connected);
        assert_eq!(status.last_error, "boom");

        state.mark_sync_success(7, 9);
        let status = state.sync_status();
        assert!(status.connected);
        assert_eq!(status.last_version, 7);
        assert_eq!(status.last_cursor, 9);
        assert!(status.last_error.is_empty());

        state.set_sync_enabled(true);
        assert!(state.sync_status().enabled);
    }
}
