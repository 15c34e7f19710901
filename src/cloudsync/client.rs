use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cloud-sync wire errors. Only `Conflict` triggers recovery; the rest
/// surface to the caller and mark the sync status.
#[derive(Debug)]
pub enum SyncError {
    Unauthorized,
    NotFound,
    Conflict {
        server_version: i64,
        server_hash: String,
    },
    Status {
        status: u16,
        message: String,
    },
    InvalidPayload(String),
    Http(reqwest::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Unauthorized => write!(f, "cloudsync unauthorized"),
            SyncError::NotFound => write!(f, "cloudsync not found"),
            SyncError::Conflict { server_version, .. } => {
                write!(f, "cloudsync conflict (server_version={server_version})")
            }
            SyncError::Status { status, message } => {
                if message.is_empty() {
                    write!(f, "cloudsync status {status}")
                } else {
                    write!(f, "cloudsync {status}: {message}")
                }
            }
            SyncError::InvalidPayload(msg) => write!(f, "cloudsync invalid payload: {msg}"),
            SyncError::Http(e) => write!(f, "cloudsync request failed: {e}"),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Http(e)
    }
}

#[derive(Debug, Serialize)]
pub struct HandshakeRequest {
    pub device_id: String,
    pub cursor: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub cursor: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListItemsResponse {
    #[serde(default)]
    pub items: Vec<SyncItem>,
    #[serde(default)]
    pub next_cursor: i64,
    #[serde(default)]
    pub latest_version: i64,
}

#[derive(Debug, Serialize)]
pub struct DeltaRequest {
    pub since_version: i64,
    pub limit: i64,
    pub cursor: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeltaResponse {
    #[serde(default)]
    pub events: Vec<SyncEvent>,
    #[serde(default)]
    pub next_cursor: i64,
}

#[derive(Debug, Serialize)]
pub struct UpsertRequest {
    pub path: String,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ResolveConflictRequest {
    pub path: String,
    pub metadata: Value,
    pub base_version: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    server_version: i64,
    #[serde(default)]
    server_hash: String,
}

/// JSON-over-HTTP client for the cloud-sync store.
#[derive(Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    user_id: String,
}

impl SyncClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str, user_id: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            user_id: user_id.trim().to_string(),
        }
    }

    pub async fn handshake(&self, req: &HandshakeRequest) -> Result<Session, SyncError> {
        self.request(reqwest::Method::POST, "/handshake", Some(req))
            .await
    }

    pub async fn list_items(
        &self,
        since_version: i64,
        limit: i64,
        cursor: i64,
    ) -> Result<ListItemsResponse, SyncError> {
        let path = format!("/items?since_version={since_version}&limit={limit}&cursor={cursor}");
        self.request::<(), _>(reqwest::Method::GET, &path, None).await
    }

    pub async fn delta(&self, req: &DeltaRequest) -> Result<DeltaResponse, SyncError> {
        self.request(reqwest::Method::POST, "/delta", Some(req)).await
    }

    pub async fn upsert_item(&self, req: &UpsertRequest) -> Result<SyncItem, SyncError> {
        self.request(reqwest::Method::POST, "/items", Some(req)).await
    }

    pub async fn resolve_conflict(
        &self,
        req: &ResolveConflictRequest,
    ) -> Result<SyncItem, SyncError> {
        self.request(reqwest::Method::POST, "/conflict/resolve", Some(req))
            .await
    }

    async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, SyncError> {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        if !self.token.is_empty() {
            let token = if self.token.to_lowercase().starts_with("bearer ") {
                self.token.clone()
            } else {
                format!("Bearer {}", self.token)
            };
            builder = builder.header("Authorization", token);
        }
        if !self.user_id.is_empty() {
            builder = builder.header("X-User-ID", &self.user_id);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(resp.json::<T>().await?);
        }

        let error_body: ErrorBody = resp.json().await.unwrap_or_default();
        Err(match status {
            401 => SyncError::Unauthorized,
            404 => SyncError::NotFound,
            409 => SyncError::Conflict {
                server_version: error_body.server_version,
                server_hash: error_body.server_hash,
            },
            _ => SyncError::Status {
                status,
                message: error_body.error.trim().to_string(),
            },
        })
    }
}
