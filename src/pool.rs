use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;

use crate::config::{AccountConfig, Config};
use crate::error::PoolError;
use crate::upstream::header_map;

#[derive(Debug, Clone, Default)]
pub struct Account {
    pub email: String,
    pub mobile: String,
    pub password: String,
    pub token: String,
}

impl Account {
    fn from_config(cfg: &AccountConfig) -> Self {
        Self {
            email: cfg.email.clone(),
            mobile: cfg.mobile.clone(),
            password: cfg.password.clone(),
            token: cfg.token.clone(),
        }
    }

    fn to_config(&self) -> AccountConfig {
        AccountConfig {
            email: self.email.clone(),
            mobile: self.mobile.clone(),
            password: self.password.clone(),
            token: self.token.clone(),
        }
    }

    /// Pool identifier: the e-mail when present, the mobile number otherwise.
    pub fn id(&self) -> String {
        let email = self.email.trim();
        if !email.is_empty() {
            return email.to_string();
        }
        self.mobile.trim().to_string()
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub active_sessions: usize,
    pub max_accounts: usize,
}

#[derive(Default, Debug)]
struct PoolInner {
    accounts: Vec<Account>,
    active: HashMap<String, usize>,
    refresh: bool,
    max_accounts: usize,
}

/// Thread-safe account roster with acquire/release counting. Accounts hand
/// out value copies; the in-use counter tracks distinct holders per id.
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<PoolInner>,
    http: reqwest::Client,
    login_url: String,
    base_headers: Vec<(&'static str, String)>,
}

impl Pool {
    pub fn new(cfg: &Config, http: reqwest::Client) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner::default()),
            http,
            login_url: cfg.url_login(),
            base_headers: cfg.base_headers(),
        });
        pool.reload(&cfg.accounts, cfg.refresh, cfg.max_active_accounts);
        pool
    }

    /// Pick a random account whose id is not excluded. When every account is
    /// excluded, fall back to the full roster so a request can retry a
    /// previously failed account instead of dying. `None` iff the roster is
    /// empty.
    pub fn acquire(self: &Arc<Self>, exclude: &HashSet<String>) -> Option<AccountGuard> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accounts.is_empty() {
            return None;
        }
        let mut candidates: Vec<usize> = (0..inner.accounts.len())
            .filter(|i| !exclude.contains(&inner.accounts[*i].id()))
            .collect();
        if candidates.is_empty() {
            candidates = (0..inner.accounts.len()).collect();
        }
        let idx = *candidates.choose(&mut rand::thread_rng()).unwrap();
        let account = inner.accounts[idx].clone();
        *inner.active.entry(account.id()).or_insert(0) += 1;
        Some(AccountGuard {
            pool: Arc::clone(self),
            account,
            released: false,
        })
    }

    fn release_id(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.active.get_mut(id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.active.remove(id);
            }
            None => {}
        }
    }

    /// Log in when the account has no token yet (or `refresh` forces it) and
    /// write the fresh token both into the caller's copy and through to the
    /// pool entry with the same identifier.
    pub async fn ensure_token(&self, account: &mut Account) -> Result<(), PoolError> {
        let refresh = self.inner.lock().unwrap().refresh;
        let has_token = !account.token.trim().is_empty();
        if has_token && !refresh {
            return Ok(());
        }
        let has_credentials = !account.password.trim().is_empty()
            && (!account.email.trim().is_empty() || !account.mobile.trim().is_empty());
        if !has_credentials {
            // Token-only accounts are usable but cannot be refreshed.
            if has_token {
                return Ok(());
            }
            return Err(PoolError::MissingCredentials);
        }

        let mut payload = json!({
            "password": account.password,
            "device_id": "deepseek_to_api",
            "os": "android",
        });
        if !account.email.trim().is_empty() {
            payload["email"] = json!(account.email);
        } else {
            payload["mobile"] = json!(account.mobile);
            payload["area_code"] = serde_json::Value::Null;
        }

        let mut headers = header_map(&self.base_headers);
        headers.remove(reqwest::header::ACCEPT_ENCODING);
        let body: serde_json::Value = self
            .http
            .post(&self.login_url)
            .headers(headers)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;

        let token = body["data"]["biz_data"]["user"]["token"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(PoolError::MissingToken);
        }
        account.token = token.clone();

        let id = account.id();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.accounts.iter_mut().find(|a| a.id() == id) {
            entry.token = token;
        }
        Ok(())
    }

    /// Replace the roster. With `0 < max < len` the roster is shuffled and
    /// truncated; counter keys no longer present are purged.
    pub fn reload(&self, accounts: &[AccountConfig], refresh: bool, max_accounts: usize) {
        let mut inner = self.inner.lock().unwrap();
        Self::reload_locked(&mut inner, accounts, refresh, max_accounts);
    }

    /// Re-apply runtime knobs over the current roster.
    pub fn update_runtime(&self, refresh: bool, max_accounts: usize) {
        let mut inner = self.inner.lock().unwrap();
        let current: Vec<AccountConfig> = inner.accounts.iter().map(Account::to_config).collect();
        Self::reload_locked(&mut inner, &current, refresh, max_accounts);
    }

    fn reload_locked(
        inner: &mut PoolInner,
        accounts: &[AccountConfig],
        refresh: bool,
        max_accounts: usize,
    ) {
        inner.refresh = refresh;
        inner.accounts = accounts.iter().map(Account::from_config).collect();
        inner.max_accounts = if max_accounts == 0 || max_accounts > inner.accounts.len() {
            inner.accounts.len()
        } else {
            max_accounts
        };
        if inner.max_accounts < inner.accounts.len() {
            inner.accounts.shuffle(&mut rand::thread_rng());
            inner.accounts.truncate(inner.max_accounts);
        }
        let valid: HashSet<String> = inner.accounts.iter().map(Account::id).collect();
        inner.active.retain(|id, _| valid.contains(id));
    }

    /// Deep copy of the roster for cloud-sync serialization.
    pub fn snapshot_accounts(&self) -> Vec<AccountConfig> {
        let inner = self.inner.lock().unwrap();
        inner.accounts.iter().map(Account::to_config).collect()
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().unwrap();
        let total = inner.accounts.len();
        let in_use = inner.active.len();
        PoolStatus {
            total,
            available: total.saturating_sub(in_use),
            in_use,
            active_sessions: inner.active.values().sum(),
            max_accounts: inner.max_accounts,
        }
    }
}

/// Scoped acquisition: dropping the guard releases the slot exactly once.
#[derive(Debug)]
pub struct AccountGuard {
    pool: Arc<Pool>,
    pub account: Account,
    released: bool,
}

impl AccountGuard {
    pub fn id(&self) -> String {
        self.account.id()
    }
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_id(&self.account.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account(email: &str, token: &str) -> AccountConfig {
        AccountConfig {
            email: email.to_string(),
            token: token.to_string(),
            ..Default::default()
        }
    }

    fn pool_with(accounts: Vec<AccountConfig>, max: usize) -> Arc<Pool> {
        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        cfg.accounts = accounts;
        cfg.max_active_accounts = max;
        Pool::new(&cfg, reqwest::Client::new())
    }

    #[test]
    fn reload_cleans_stale_active_sessions() {
        let pool = pool_with(
            vec![account("a@example.com", "t1"), account("b@example.com", "t2")],
            2,
        );

        let guard = pool.acquire(&HashSet::new()).expect("acquire");
        assert_eq!(pool.status().active_sessions, 1);

        pool.reload(&[account("c@example.com", "t3")], false, 1);

        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.max_accounts, 1);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.active_sessions, 0);

        let next = pool.acquire(&HashSet::new()).expect("acquire after reload");
        assert_eq!(next.id(), "c@example.com");
        drop(next);
        drop(guard);
    }

    #[test]
    fn reload_applies_max_account_limit() {
        let pool = pool_with(
            vec![
                account("a@example.com", "t1"),
                account("b@example.com", "t2"),
                account("c@example.com", "t3"),
            ],
            3,
        );
        pool.reload(&pool.snapshot_accounts(), false, 1);

        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.max_accounts, 1);
        assert_eq!(status.available, 1);
    }

    #[test]
    fn update_runtime_keeps_the_roster() {
        let pool = pool_with(
            vec![account("a@example.com", "t1"), account("b@example.com", "t2")],
            2,
        );
        pool.update_runtime(true, 1);
        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.max_accounts, 1);
        // The surviving account came from the existing roster.
        let id = pool.snapshot_accounts()[0].email.clone();
        assert!(id == "a@example.com" || id == "b@example.com");
    }

    #[test]
    fn acquire_on_empty_roster_fails() {
        let pool = pool_with(vec![], 0);
        assert!(pool.acquire(&HashSet::new()).is_none());
    }

    #[test]
    fn balanced_acquire_release_empties_the_counter() {
        let pool = pool_with(vec![account("a@example.com", "t1")], 1);
        let g1 = pool.acquire(&HashSet::new()).unwrap();
        let g2 = pool.acquire(&HashSet::new()).unwrap();
        assert_eq!(pool.status().active_sessions, 2);
        drop(g1);
        assert_eq!(pool.status().active_sessions, 1);
        drop(g2);
        let status = pool.status();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.in_use, 0);
    }

    #[test]
    fn acquire_falls_back_when_everything_is_excluded() {
        let pool = pool_with(vec![account("a@example.com", "t1")], 1);
        let exclude: HashSet<String> = ["a@example.com".to_string()].into();
        let guard = pool.acquire(&exclude).expect("fallback to full roster");
        assert_eq!(guard.id(), "a@example.com");
    }

    #[test]
    fn acquire_respects_exclusion_when_alternatives_exist() {
        let pool = pool_with(
            vec![account("a@example.com", "t1"), account("b@example.com", "t2")],
            2,
        );
        let exclude: HashSet<String> = ["a@example.com".to_string()].into();
        for _ in 0..10 {
            let guard = pool.acquire(&exclude).unwrap();
            assert_eq!(guard.id(), "b@example.com");
        }
    }

    #[tokio::test]
    async fn ensure_token_logs_in_and_writes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/users/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"biz_data": {"user": {"token": "fresh-token"}}}
            })))
            .mount(&server)
            .await;

        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        cfg.accounts = vec![AccountConfig {
            email: "a@example.com".to_string(),
            password: "pw".to_string(),
            ..Default::default()
        }];
        let pool = Arc::new(Pool {
            inner: Mutex::new(PoolInner::default()),
            http: reqwest::Client::new(),
            login_url: format!("{}/api/v0/users/login", server.uri()),
            base_headers: cfg.base_headers(),
        });
        pool.reload(&cfg.accounts, false, 0);

        let mut guard = pool.acquire(&HashSet::new()).unwrap();
        pool.ensure_token(&mut guard.account).await.unwrap();
        assert_eq!(guard.account.token, "fresh-token");
        // The roster entry picked up the token as well.
        assert_eq!(pool.snapshot_accounts()[0].token, "fresh-token");
    }

    #[tokio::test]
    async fn ensure_token_is_a_noop_with_existing_token() {
        let pool = pool_with(vec![account("a@example.com", "t1")], 1);
        let mut guard = pool.acquire(&HashSet::new()).unwrap();
        pool.ensure_token(&mut guard.account).await.unwrap();
        assert_eq!(guard.account.token, "t1");
    }

    #[tokio::test]
    async fn ensure_token_without_credentials_fails() {
        let pool = pool_with(
            vec![AccountConfig {
                email: "a@example.com".to_string(),
                ..Default::default()
            }],
            1,
        );
        let mut guard = pool.acquire(&HashSet::new()).unwrap();
        let err = pool.ensure_token(&mut guard.account).await.unwrap_err();
        assert!(matches!(err, PoolError::MissingCredentials));
    }
}
