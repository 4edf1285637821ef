//! Historical-archive lookup client.
//!
//! Searches by id list with a bearer token. An expired token (401/403) is
//! rotated at most once across every task in this process and every run on
//! the host sharing the same [`TokenStore`]:
//!
//! 1. take the in-process rotation mutex, then the store's advisory lock
//! 2. if the persisted token differs from the stale one, another run already
//!    rotated it, so reuse it
//! 3. otherwise ask the auth service for a new one and persist it
//!
//! Running out of attempts ends the run.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::token::{acquire_rotation_lock, TokenStore};
use super::{prepare_payload, BackfillError, BackfillProvider};
use crate::config::ArchiveConfig;
use crate::models::{now_epoch, Provenance, RecordKind};

/// Refresh reply for a token the service will not rotate yet.
const STILL_ACTIVE_DETAIL: &str = "Access token is still active and can not be refreshed.";

const LOCK_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Value>,
}

pub struct HistoricalArchiveClient {
    client: Client,
    config: ArchiveConfig,
    tokens: Arc<dyn TokenStore>,
    current: RwLock<Option<String>>,
    rotation: Mutex<()>,
}

impl HistoricalArchiveClient {
    /// Build a client, seeding the working token from `tokens`.
    pub fn new(config: ArchiveConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, BackfillError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        let current = tokens.load()?;
        if current.is_none() {
            warn!("No archive token persisted yet");
        }

        Ok(Self {
            client,
            config,
            tokens,
            current: RwLock::new(current),
            rotation: Mutex::new(()),
        })
    }

    /// Token currently used for requests.
    pub fn token(&self) -> Option<String> {
        self.current.read().clone()
    }

    fn search_url(&self, kind: RecordKind, ids: &[String]) -> String {
        format!(
            "{}/reddit/{}/search?limit=1000&ids={}",
            self.config.base_url.trim_end_matches('/'),
            kind.api_name(),
            ids.join(",")
        )
    }

    /// Replace `stale` with a working token.
    async fn rotate(&self, stale: &str) -> Result<String, BackfillError> {
        let _in_process = self.rotation.lock().await;

        // Another task may have finished a rotation while we waited.
        if let Some(current) = self.token().filter(|t| t != stale) {
            return Ok(current);
        }

        let _guard = acquire_rotation_lock(
            self.tokens.as_ref(),
            Duration::from_secs(self.config.lock_wait_secs),
            LOCK_POLL,
        )
        .await?;

        if let Some(saved) = self.tokens.load()?.filter(|t| t != stale) {
            info!("Archive token already rotated by another run, reusing it");
            *self.current.write() = Some(saved.clone());
            return Ok(saved);
        }

        let url = format!("{}/refresh", self.config.auth_url.trim_end_matches('/'));
        warn!(url = %url, "Requesting new archive token");
        let response = timeout(
            self.config.request_timeout(),
            self.client.post(&url).query(&[("access_token", stale)]).send(),
        )
        .await
        .map_err(|_| BackfillError::AuthRejected("refresh request timed out".into()))??;
        let body: Value = response.json().await?;

        if let Some(token) = body.get("access_token").and_then(Value::as_str) {
            self.tokens.save(token)?;
            *self.current.write() = Some(token.to_string());
            warn!("Archive token rotated");
            return Ok(token.to_string());
        }

        match body.get("detail").and_then(Value::as_str) {
            Some(STILL_ACTIVE_DETAIL) => {
                warn!("Archive token still active, retrying with it");
                sleep(Duration::from_millis(self.config.still_active_wait_ms)).await;
                Ok(stale.to_string())
            }
            Some(detail) => Err(BackfillError::AuthRejected(detail.to_string())),
            None => Err(BackfillError::AuthRejected(format!(
                "unexpected refresh response: {}",
                body
            ))),
        }
    }
}

#[async_trait]
impl BackfillProvider for HistoricalArchiveClient {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Archive
    }

    fn batch_limit(&self) -> usize {
        self.config.batch_size
    }

    async fn lookup(&self, kind: RecordKind, ids: &[String]) -> Result<Vec<Value>, BackfillError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.search_url(kind, ids);
        let mut token = self.token().ok_or(BackfillError::MissingToken)?;
        let mut last = String::from("no attempts made");
        debug!(url = %url, "Archive query");

        for attempt in 0..self.config.max_attempts {
            let request = self.client.get(&url).bearer_auth(&token).send();
            match timeout(self.config.request_timeout(), request).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<SearchResponse>().await {
                            Ok(body) => {
                                if attempt > 0 {
                                    info!("Archive call succeeded after {} attempts", attempt + 1);
                                }
                                let now = now_epoch();
                                return Ok(body
                                    .data
                                    .into_iter()
                                    .map(|value| prepare_payload(value, now, false))
                                    .collect());
                            }
                            Err(e) => last = format!("undecodable body: {}", e),
                        }
                    } else {
                        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                            warn!(status = %status, "Archive token rejected, rotating");
                            token = self.rotate(&token).await?;
                        }
                        last = format!("status {}", status);
                    }
                }
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = "request timed out".to_string(),
            }

            let backoff = self.config.backoff(attempt);
            info!("Archive lookup failed ({}), sleeping {:?}", last, backoff);
            sleep(backoff).await;
        }

        warn!(url = %url, "{} archive requests failed", self.config.max_attempts);
        Err(BackfillError::RetriesExhausted {
            provider: "archive",
            attempts: self.config.max_attempts,
            last,
        })
    }
}
