use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use serde_json::{json, Value};

use crate::error::UpstreamError;
use crate::pow::{hash_key, AnswerCache, PowSolver};
use crate::util::now_unix;

const ATTEMPT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_DIFFICULTY: i64 = 144000;
const BODY_PREVIEW_BYTES: usize = 512;

/// Build a reqwest header map from the configured base header pairs.
pub fn header_map(pairs: &[(&'static str, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Client for the DeepSeek consumer chat endpoints: session creation, PoW
/// challenge minting and the completion call in its three flavors.
#[derive(Clone)]
pub struct DeepSeekClient {
    http: reqwest::Client,
    url_session: String,
    url_pow: String,
    url_completion: String,
}

impl DeepSeekClient {
    pub fn new(
        http: reqwest::Client,
        url_session: String,
        url_pow: String,
        url_completion: String,
    ) -> Self {
        Self {
            http,
            url_session,
            url_pow,
            url_completion,
        }
    }

    /// POST `{"agent":"chat"}` until the upstream hands back a session id.
    pub async fn create_session(
        &self,
        headers: &HeaderMap,
        max_attempts: u32,
    ) -> Result<String, UpstreamError> {
        for _ in 0..max_attempts {
            let resp = self
                .http
                .post(&self.url_session)
                .headers(headers.clone())
                .json(&json!({"agent": "chat"}))
                .send()
                .await;
            if let Ok(resp) = resp {
                let status = resp.status();
                if let Ok(body) = resp.json::<Value>().await {
                    if status.as_u16() == 200 && body["code"].as_i64() == Some(0) {
                        if let Some(id) = body["data"]["biz_data"]["id"].as_str() {
                            if !id.is_empty() {
                                return Ok(id.to_string());
                            }
                        }
                    }
                }
            }
            tokio::time::sleep(ATTEMPT_DELAY).await;
        }
        Err(UpstreamError::SessionFailed)
    }

    /// Fetch a PoW challenge and return the Base64-encoded answer, consulting
    /// the cache by challenge fingerprint first. Solver misses wait a second
    /// and retry with a fresh challenge.
    pub async fn get_pow(
        &self,
        headers: &HeaderMap,
        solver: &Arc<PowSolver>,
        cache: &AnswerCache,
        max_attempts: u32,
    ) -> Result<String, UpstreamError> {
        for _ in 0..max_attempts {
            let resp = self
                .http
                .post(&self.url_pow)
                .headers(headers.clone())
                .json(&json!({"target_path": "/api/v0/chat/completion"}))
                .send()
                .await;
            if let Ok(resp) = resp {
                let status = resp.status();
                if let Ok(body) = resp.json::<Value>().await {
                    if status.as_u16() == 200 && body["code"].as_i64() == Some(0) {
                        let challenge = &body["data"]["biz_data"]["challenge"];
                        if let Some(answer) = self.answer_challenge(challenge, solver, cache).await
                        {
                            return Ok(answer);
                        }
                    }
                }
            }
            tokio::time::sleep(ATTEMPT_DELAY).await;
        }
        Err(UpstreamError::PowFailed)
    }

    async fn answer_challenge(
        &self,
        challenge: &Value,
        solver: &Arc<PowSolver>,
        cache: &AnswerCache,
    ) -> Option<String> {
        let algorithm = challenge["algorithm"].as_str().unwrap_or("").to_string();
        let challenge_str = challenge["challenge"].as_str().unwrap_or("").to_string();
        let salt = challenge["salt"].as_str().unwrap_or("").to_string();
        let signature = challenge["signature"].as_str().unwrap_or("").to_string();
        let target_path = challenge["target_path"].as_str().unwrap_or("").to_string();
        let difficulty = challenge["difficulty"]
            .as_f64()
            .map(|f| f as i64)
            .unwrap_or(DEFAULT_DIFFICULTY);
        let expire_at = challenge["expire_at"]
            .as_f64()
            .map(|f| f as i64)
            .unwrap_or_else(|| now_unix() + 60);
        tracing::debug!(
            algorithm = %algorithm,
            difficulty,
            expire_at,
            target_path = %target_path,
            "pow challenge"
        );

        let key = hash_key(&[&algorithm, &challenge_str, &salt, &signature, &target_path]);
        if let Some(cached) = cache.get(&key) {
            return Some(cached);
        }

        // The nonce search is pure CPU; keep it off the async workers.
        let task_solver = Arc::clone(solver);
        let (task_algorithm, task_challenge, task_salt) =
            (algorithm.clone(), challenge_str.clone(), salt.clone());
        let answer = tokio::task::spawn_blocking(move || {
            task_solver.solve(
                &task_algorithm,
                &task_challenge,
                &task_salt,
                difficulty,
                expire_at,
            )
        })
        .await
        .ok()??;

        let payload = json!({
            "algorithm": algorithm,
            "challenge": challenge_str,
            "salt": salt,
            "answer": answer,
            "signature": signature,
            "target_path": target_path,
        });
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(payload.to_string().as_bytes());
        cache.set(&key, &encoded, expire_at);
        Some(encoded)
    }

    /// Completion call with `stream` forced on; returns the live response.
    pub async fn completion_stream_request(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut payload = payload.clone();
        payload["stream"] = json!(true);
        self.completion_request(headers, &payload).await
    }

    /// Completion call with `stream` forced off; parses the JSON body.
    pub async fn completion_json_request(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<Value, UpstreamError> {
        let mut payload = payload.clone();
        payload["stream"] = json!(false);
        let resp = self.completion_request(headers, &payload).await?;
        Ok(resp.json::<Value>().await?)
    }

    /// Completion call with the payload passed through verbatim.
    pub async fn completion_raw_stream_request(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.completion_request(headers, payload).await
    }

    async fn completion_request(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut headers = headers.clone();
        headers.remove(ACCEPT_ENCODING);
        tracing::debug!(payload = %payload, "completion payload");
        let resp = self
            .http
            .post(&self.url_completion)
            .headers(headers)
            .json(payload)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            let preview = body_preview(resp).await;
            tracing::debug!(status, preview = %preview, "completion failed");
            return Err(UpstreamError::Status { status, preview });
        }
        Ok(resp)
    }
}

async fn body_preview(resp: reqwest::Response) -> String {
    let bytes = resp.bytes().await.unwrap_or_default();
    let end = bytes.len().min(BODY_PREVIEW_BYTES);
    String::from_utf8_lossy(&bytes[..end]).to_string()
}
