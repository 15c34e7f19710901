use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::client::{
    DeltaRequest, HandshakeRequest, ResolveConflictRequest, SyncClient, SyncError, SyncItem,
    UpsertRequest,
};
use crate::config::{default_claude_mapping, AccountConfig, CloudSyncConfig};
use crate::state::AppState;

const ACCOUNTS_PATH: &str = "/deepseek2api/accounts";
const CONFIG_PATH: &str = "/deepseek2api/config";

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncConfigPayload {
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub max_active_accounts: usize,
    #[serde(default)]
    pub claude_model_mapping: Option<HashMap<String, String>>,
}

#[derive(Default)]
struct Counters {
    version: i64,
    cursor: i64,
}

/// Versioned pull/push against the shared store. `version` and `cursor` only
/// ever move forward; a lower-versioned item can never regress local state.
pub struct SyncManager {
    state: AppState,
    client: SyncClient,
    cfg: CloudSyncConfig,
    counters: Mutex<Counters>,
}

impl SyncManager {
    pub fn new(state: AppState, client: SyncClient, cfg: CloudSyncConfig) -> Self {
        Self {
            state,
            client,
            cfg,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn version(&self) -> i64 {
        self.counters.lock().unwrap().version
    }

    pub fn cursor(&self) -> i64 {
        self.counters.lock().unwrap().cursor
    }

    fn bump_version(&self, version: i64) {
        let mut counters = self.counters.lock().unwrap();
        if version > counters.version {
            counters.version = version;
        }
    }

    fn advance_from_item(&self, item: &SyncItem) {
        let mut counters = self.counters.lock().unwrap();
        if item.version > counters.version {
            counters.version = item.version;
        }
        if item.version > counters.cursor {
            counters.cursor = item.version;
        }
    }

    /// Handshake, catch up with the store, then publish the local snapshot.
    pub async fn initial_sync(&self) -> Result<(), SyncError> {
        match self
            .client
            .handshake(&HandshakeRequest {
                device_id: self.cfg.device_id.clone(),
                cursor: self.cursor(),
            })
            .await
        {
            Ok(session) => {
                self.counters.lock().unwrap().cursor = session.cursor;
            }
            Err(e) => {
                self.state.mark_sync_error(&e.to_string());
                return Err(e);
            }
        }
        if let Err(e) = self.pull_and_apply().await {
            self.state.mark_sync_error(&e.to_string());
            return Err(e);
        }
        if let Err(e) = self.push_local_snapshot().await {
            self.state.mark_sync_error(&e.to_string());
            return Err(e);
        }
        self.state.mark_sync_success(self.version(), self.cursor());
        Ok(())
    }

    /// Periodic loop; runs until the task is aborted at shutdown.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.interval_seconds));
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            match self.sync_once().await {
                Ok(()) => {
                    self.state.mark_sync_success(self.version(), self.cursor());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sync tick failed");
                    self.state.mark_sync_error(&e.to_string());
                }
            }
        }
    }

    pub async fn sync_once(&self) -> Result<(), SyncError> {
        self.pull_and_apply().await?;
        self.push_local_snapshot().await
    }

    async fn pull_and_apply(&self) -> Result<(), SyncError> {
        let (since, mut cursor) = {
            let counters = self.counters.lock().unwrap();
            (counters.version, counters.cursor)
        };
        let limit = self.cfg.limit;

        let list = self.client.list_items(since, limit, cursor).await?;
        self.apply_items(&list.items)?;

        let delta = self
            .client
            .delta(&DeltaRequest {
                since_version: since,
                limit,
                cursor,
            })
            .await?;

        if list.next_cursor > cursor {
            cursor = list.next_cursor;
        }
        if delta.next_cursor > cursor {
            cursor = delta.next_cursor;
        }

        let mut counters = self.counters.lock().unwrap();
        if list.latest_version > counters.version {
            counters.version = list.latest_version;
        }
        if cursor > counters.cursor {
            counters.cursor = cursor;
        }
        Ok(())
    }

    fn apply_items(&self, items: &[SyncItem]) -> Result<(), SyncError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut remote_accounts: Option<Vec<AccountConfig>> = None;
        let mut remote_cfg: Option<SyncConfigPayload> = None;
        for item in items {
            if item.deleted {
                continue;
            }
            match item.path.trim() {
                ACCOUNTS_PATH => remote_accounts = Some(decode_accounts(&item.metadata)?),
                CONFIG_PATH => remote_cfg = Some(decode_config_payload(&item.metadata)?),
                _ => {}
            }
            self.bump_version(item.version);
        }

        if let Some(cfg_payload) = &remote_cfg {
            self.state.update_sync_runtime(
                cfg_payload.refresh,
                cfg_payload.max_active_accounts,
                cfg_payload
                    .claude_model_mapping
                    .clone()
                    .unwrap_or_else(default_claude_mapping),
            );
        }
        if remote_cfg.is_some() || remote_accounts.is_some() {
            let cfg = self.state.get_config();
            let accounts =
                remote_accounts.unwrap_or_else(|| self.state.pool().snapshot_accounts());
            self.state
                .pool()
                .reload(&accounts, cfg.refresh, cfg.max_active_accounts);
            tracing::info!(
                accounts = accounts.len(),
                refresh = cfg.refresh,
                max = cfg.max_active_accounts,
                "applied synced state"
            );
        }
        Ok(())
    }

    async fn push_local_snapshot(&self) -> Result<(), SyncError> {
        let cfg = self.state.get_config();
        let accounts = self.state.pool().snapshot_accounts();

        let accounts_meta = json!({ "accounts": accounts });
        let config_meta = serde_json::to_value(SyncConfigPayload {
            refresh: cfg.refresh,
            max_active_accounts: cfg.max_active_accounts,
            claude_model_mapping: Some(cfg.claude_model_mapping),
        })
        .unwrap_or(Value::Null);

        self.upsert_with_conflict_retry(ACCOUNTS_PATH, accounts_meta)
            .await?;
        self.upsert_with_conflict_retry(CONFIG_PATH, config_meta)
            .await
    }

    /// Optimistic upsert: send our current version as the CAS base. On a 409
    /// catch up with the store first, then resolve against the version the
    /// server reported.
    async fn upsert_with_conflict_retry(
        &self,
        path: &str,
        metadata: Value,
    ) -> Result<(), SyncError> {
        let base = self.version();
        match self
            .client
            .upsert_item(&UpsertRequest {
                path: path.to_string(),
                metadata: metadata.clone(),
                base_version: Some(base),
            })
            .await
        {
            Ok(item) => {
                self.advance_from_item(&item);
                Ok(())
            }
            Err(SyncError::Conflict { server_version, .. }) => {
                tracing::info!(path, server_version, "upsert conflict, recovering");
                self.pull_and_apply().await?;
                let resolved = self
                    .client
                    .resolve_conflict(&ResolveConflictRequest {
                        path: path.to_string(),
                        metadata,
                        base_version: server_version,
                    })
                    .await?;
                self.advance_from_item(&resolved);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn decode_accounts(metadata: &Value) -> Result<Vec<AccountConfig>, SyncError> {
    #[derive(Deserialize)]
    struct Wrapped {
        accounts: Option<Vec<AccountConfig>>,
    }
    if let Ok(Wrapped {
        accounts: Some(accounts),
    }) = serde_json::from_value::<Wrapped>(metadata.clone())
    {
        return Ok(accounts);
    }
    if let Ok(direct) = serde_json::from_value::<Vec<AccountConfig>>(metadata.clone()) {
        return Ok(direct);
    }
    Err(SyncError::InvalidPayload("invalid accounts payload".to_string()))
}

fn decode_config_payload(metadata: &Value) -> Result<SyncConfigPayload, SyncError> {
    let mut payload: SyncConfigPayload = serde_json::from_value(metadata.clone())
        .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
    if payload.claude_model_mapping.is_none() {
        payload.claude_model_mapping = Some(default_claude_mapping());
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pool::Pool;
    use crate::pow::{AnswerCache, PowSolver};
    use crate::upstream::DeepSeekClient;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_with(accounts: Vec<AccountConfig>) -> AppState {
        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        cfg.accounts = accounts;
        cfg.max_active_accounts = 1;
        cfg.claude_model_mapping = default_claude_mapping();
        let http = reqwest::Client::new();
        let pool = Pool::new(&cfg, http.clone());
        let deepseek = DeepSeekClient::new(
            http.clone(),
            cfg.url_session(),
            cfg.url_create_pow(),
            cfg.url_completion(),
        );
        AppState::new(
            cfg,
            http,
            pool,
            Arc::new(PowSolver::new("native", "")),
            AnswerCache::new(),
            deepseek,
        )
    }

    fn manager(state: AppState, base_url: &str) -> SyncManager {
        let client = SyncClient::new(reqwest::Client::new(), base_url, "", "u1");
        SyncManager::new(
            state,
            client,
            CloudSyncConfig {
                enabled: true,
                limit: 100,
                interval_seconds: 1,
                device_id: "d1".to_string(),
                ..Default::default()
            },
        )
    }

    fn account(email: &str, token: &str) -> AccountConfig {
        AccountConfig {
            email: email.to_string(),
            token: token.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_conflict_recovers_via_pull_and_resolve() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [], "next_cursor": 0, "latest_version": 7
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/delta"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [], "next_cursor": 0
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": "conflict", "server_version": 7, "server_hash": "hash-7"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/conflict/resolve"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "item-1",
                "path": ACCOUNTS_PATH,
                "metadata": {"accounts": []},
                "version": 8,
                "hash": "hash-8",
                "deleted": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = state_with(vec![account("a@example.com", "t")]);
        let m = manager(state, &server.uri());

        m.upsert_with_conflict_retry(ACCOUNTS_PATH, json!({"accounts": []}))
            .await
            .unwrap();
        assert_eq!(m.version(), 8);
        assert_eq!(m.cursor(), 8);
    }

    #[tokio::test]
    async fn apply_items_updates_runtime_and_pool() {
        let state = state_with(vec![account("old@example.com", "t-old")]);
        let m = manager(state.clone(), "http://127.0.0.1:1");

        let items = vec![
            SyncItem {
                path: CONFIG_PATH.to_string(),
                version: 10,
                metadata: json!({
                    "refresh": true,
                    "max_active_accounts": 2,
                    "claude_model_mapping": {
                        "fast": "deepseek-reasoner",
                        "slow": "deepseek-chat"
                    }
                }),
                ..Default::default()
            },
            SyncItem {
                path: ACCOUNTS_PATH.to_string(),
                version: 11,
                metadata: json!({"accounts": [
                    {"email": "new1@example.com", "token": "t1"},
                    {"email": "new2@example.com", "token": "t2"}
                ]}),
                ..Default::default()
            },
        ];
        m.apply_items(&items).unwrap();

        let cfg = state.get_config();
        assert!(cfg.refresh);
        assert_eq!(cfg.max_active_accounts, 2);
        assert_eq!(cfg.claude_model_mapping["fast"], "deepseek-reasoner");

        let status = state.pool().status();
        assert_eq!(status.total, 2);
        assert_eq!(status.max_accounts, 2);
        assert_eq!(m.version(), 11);
    }

    #[tokio::test]
    async fn config_item_alone_reloads_with_current_roster() {
        let state = state_with(vec![account("keep@example.com", "t")]);
        let m = manager(state.clone(), "http://127.0.0.1:1");

        let items = vec![SyncItem {
            path: CONFIG_PATH.to_string(),
            version: 3,
            metadata: json!({"refresh": false, "max_active_accounts": 5}),
            ..Default::default()
        }];
        m.apply_items(&items).unwrap();

        let status = state.pool().status();
        assert_eq!(status.total, 1);
        // Mapping defaulted when absent from the item.
        assert_eq!(state.get_config().claude_model_mapping["slow"], "deepseek-chat");
    }

    #[tokio::test]
    async fn deleted_items_are_skipped() {
        let state = state_with(vec![account("keep@example.com", "t")]);
        let m = manager(state.clone(), "http://127.0.0.1:1");

        let items = vec![SyncItem {
            path: ACCOUNTS_PATH.to_string(),
            version: 4,
            deleted: true,
            metadata: json!({"accounts": []}),
            ..Default::default()
        }];
        m.apply_items(&items).unwrap();
        assert_eq!(state.pool().status().total, 1);
        assert_eq!(m.version(), 0);
    }

    #[test]
    fn bare_account_arrays_are_accepted_on_read() {
        let accounts =
            decode_accounts(&json!([{"email": "x@example.com", "token": "t"}])).unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(decode_accounts(&json!("garbage")).is_err());
    }
}
