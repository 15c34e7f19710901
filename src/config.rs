use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudSyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub interval_seconds: u64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub pow_solver: String,
    #[serde(default)]
    pub max_active_accounts: usize,
    #[serde(default)]
    pub claude_model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub cloud_sync: CloudSyncConfig,

    #[serde(skip)]
    pub port: u16,
    #[serde(skip)]
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub log_level: String,
    #[serde(skip)]
    pub deepseek_host: String,
    #[serde(skip)]
    pub pow_wasm_path: String,
}

impl Config {
    /// Load configuration: `API_CONFIG` inline JSON wins, then the first
    /// readable of `CONFIG_PATH`, `./config.json`, `../config.json`.
    /// Environment variables override the runtime knobs afterwards.
    pub fn load() -> Self {
        let mut cfg = Config::default();

        if let Ok(inline) = env::var("API_CONFIG") {
            if !inline.trim().is_empty() {
                if let Ok(parsed) = serde_json::from_str::<Config>(&inline) {
                    cfg = parsed;
                }
            }
        }
        if cfg.keys.is_empty() && cfg.accounts.is_empty() {
            let candidates = [
                env::var("CONFIG_PATH").unwrap_or_default(),
                "config.json".to_string(),
                "../config.json".to_string(),
            ];
            for path in candidates {
                if path.trim().is_empty() {
                    continue;
                }
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(parsed) = serde_json::from_str::<Config>(&raw) {
                        cfg = parsed;
                    }
                    break;
                }
            }
        }

        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if self.claude_model_mapping.is_empty() {
            self.claude_model_mapping = default_claude_mapping();
        }
        self.port = env_var("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(5001);
        self.log_level = env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        self.deepseek_host =
            env_var("DEEPSEEK_HOST").unwrap_or_else(|| "chat.deepseek.com".to_string());
        self.request_timeout_secs = env_var("REQUEST_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);
        if let Some(mode) = env_var("POW_SOLVER") {
            self.pow_solver = mode.to_lowercase();
        }
        self.pow_wasm_path = env_var("POW_WASM_PATH")
            .unwrap_or_else(|| "../sha3_wasm_bg.7b9ca65ddd.wasm".to_string());

        let cs = &mut self.cloud_sync;
        if let Some(v) = env_var("CLOUDSYNC_ENABLED").and_then(|v| parse_bool(&v)) {
            cs.enabled = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_BASE_URL") {
            cs.base_url = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_TOKEN") {
            cs.token = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_USER_ID") {
            cs.user_id = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_DEVICE_ID") {
            cs.device_id = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_INTERVAL_SECONDS").and_then(|v| v.parse().ok()) {
            cs.interval_seconds = v;
        }
        if let Some(v) = env_var("CLOUDSYNC_LIMIT").and_then(|v| v.parse().ok()) {
            cs.limit = v;
        }
        if cs.interval_seconds == 0 {
            cs.interval_seconds = 30;
        }
        if cs.limit <= 0 {
            cs.limit = 100;
        }
        if cs.user_id.trim().is_empty() {
            cs.user_id = "default".to_string();
        }
        if cs.device_id.trim().is_empty() {
            cs.device_id = match hostname() {
                Some(host) => format!("deepseek2api-{host}"),
                None => "deepseek2api-device".to_string(),
            };
        }
        cs.base_url = cs.base_url.trim().trim_end_matches('/').to_string();
    }

    pub fn url_login(&self) -> String {
        format!("https://{}/api/v0/users/login", self.deepseek_host)
    }

    pub fn url_session(&self) -> String {
        format!("https://{}/api/v0/chat_session/create", self.deepseek_host)
    }

    pub fn url_create_pow(&self) -> String {
        format!(
            "https://{}/api/v0/chat/create_pow_challenge",
            self.deepseek_host
        )
    }

    pub fn url_completion(&self) -> String {
        format!("https://{}/api/v0/chat/completion", self.deepseek_host)
    }

    /// Header set sent on every upstream call. Completion and login calls
    /// strip `Accept-Encoding` before sending.
    pub fn base_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Host", self.deepseek_host.clone()),
            ("User-Agent", "DeepSeek/1.0.13 Android/35".to_string()),
            ("Accept", "application/json".to_string()),
            ("Accept-Encoding", "gzip".to_string()),
            ("Content-Type", "application/json".to_string()),
            ("x-client-platform", "android".to_string()),
            ("x-client-version", "1.3.0-auto-resume".to_string()),
            ("x-client-locale", "zh_CN".to_string()),
            ("accept-charset", "UTF-8".to_string()),
        ]
    }
}

pub fn default_claude_mapping() -> HashMap<String, String> {
    HashMap::from([
        ("fast".to_string(), "deepseek-chat".to_string()),
        ("slow".to_string(), "deepseek-chat".to_string()),
    ])
}

fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn hostname() -> Option<String> {
    let name = std::fs::read_to_string("/etc/hostname")
        .ok()
        .or_else(|| env::var("HOSTNAME").ok())?;
    let name = name.trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_json() {
        let raw = r#"{
            "keys": ["k1"],
            "accounts": [{"email": "a@example.com", "token": "t"}],
            "max_active_accounts": 2,
            "cloud_sync": {"enabled": true, "base_url": "https://sync.example.com/"}
        }"#;
        let mut cfg: Config = serde_json::from_str(raw).unwrap();
        cfg.apply_env();

        assert_eq!(cfg.keys, vec!["k1"]);
        assert_eq!(cfg.accounts.len(), 1);
        assert_eq!(cfg.claude_model_mapping["fast"], "deepseek-chat");
        assert_eq!(cfg.claude_model_mapping["slow"], "deepseek-chat");
        assert!(cfg.cloud_sync.enabled);
        assert_eq!(cfg.cloud_sync.base_url, "https://sync.example.com");
        assert_eq!(cfg.cloud_sync.interval_seconds, 30);
        assert_eq!(cfg.cloud_sync.limit, 100);
        assert_eq!(cfg.cloud_sync.user_id, "default");
    }

    #[test]
    fn upstream_urls_follow_host() {
        let mut cfg = Config::default();
        cfg.deepseek_host = "chat.deepseek.com".to_string();
        assert_eq!(
            cfg.url_session(),
            "https://chat.deepseek.com/api/v0/chat_session/create"
        );
        assert_eq!(
            cfg.url_completion(),
            "https://chat.deepseek.com/api/v0/chat/completion"
        );
    }
}
