//! Live API lookup client.
//!
//! Uses an OAuth password grant and the `/api/info` endpoint. Rate limiting
//! (429) is retried after the server's `Retry-After`. Unlike the
//! archive, failures here are never fatal: a batch that cannot be fetched is
//! logged and returned empty.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::{prepare_payload, BackfillError, BackfillProvider};
use crate::config::{LiveConfig, LiveCredentials};
use crate::models::{now_epoch, Provenance, RecordKind};

/// Tokens are refreshed this long before the server says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Value,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct LiveApiClient {
    client: Client,
    config: LiveConfig,
    credentials: LiveCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl LiveApiClient {
    pub fn new(config: LiveConfig, credentials: LiveCredentials) -> Result<Self, BackfillError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            config,
            credentials,
            token: Mutex::new(None),
        })
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.access_token.clone())
    }

    fn invalidate_token(&self) {
        *self.token.lock() = None;
    }

    async fn access_token(&self) -> Result<String, String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let form = [
            ("grant_type", "password"),
            ("username", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];
        let request = self
            .client
            .post(&self.config.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&form)
            .send();
        let response = timeout(self.config.request_timeout(), request)
            .await
            .map_err(|_| "token request timed out".to_string())?
            .map_err(|e| format!("token request failed: {}", e))?;
        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("token response ({}) undecodable: {}", status, e))?;

        let Some(access_token) = body.access_token else {
            return Err(format!(
                "token request refused ({}): {}",
                status,
                body.error.unwrap_or_default()
            ));
        };
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(EXPIRY_MARGIN);
        *self.token.lock() = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!("Obtained live API token");
        Ok(access_token)
    }

    fn info_url(&self, kind: RecordKind, ids: &[String]) -> String {
        let prefix = kind.fullname_prefix();
        let fullnames: Vec<String> = ids.iter().map(|id| format!("{}{}", prefix, id)).collect();
        format!(
            "{}/api/info?id={}",
            self.config.api_url.trim_end_matches('/'),
            fullnames.join(",")
        )
    }
}

/// Seconds form of a `Retry-After` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[async_trait]
impl BackfillProvider for LiveApiClient {
    fn name(&self) -> &'static str {
        "live"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Backfill
    }

    fn batch_limit(&self) -> usize {
        self.config.batch_size
    }

    async fn lookup(&self, kind: RecordKind, ids: &[String]) -> Result<Vec<Value>, BackfillError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.info_url(kind, ids);
        let mut last = String::from("no attempts made");

        for attempt in 0..self.config.max_attempts {
            let mut wait_hint = None;
            match self.access_token().await {
                Ok(token) => {
                    let request = self.client.get(&url).bearer_auth(&token).send();
                    match timeout(self.config.request_timeout(), request).await {
                        Ok(Ok(response)) => {
                            let status = response.status();
                            if status.is_success() {
                                match response.json::<Listing>().await {
                                    Ok(listing) => {
                                        let now = now_epoch();
                                        return Ok(listing
                                            .data
                                            .children
                                            .into_iter()
                                            .map(|child| prepare_payload(child.data, now, true))
                                            .collect());
                                    }
                                    Err(e) => last = format!("undecodable body: {}", e),
                                }
                            } else if status == StatusCode::UNAUTHORIZED {
                                self.invalidate_token();
                                last = format!("status {}", status);
                            } else if status == StatusCode::TOO_MANY_REQUESTS {
                                wait_hint = retry_after(response.headers());
                                last = format!("status {}", status);
                            } else if status.is_server_error() {
                                last = format!("status {}", status);
                            } else {
                                warn!(
                                    kind = %kind,
                                    status = %status,
                                    "Live API refused batch of {} ids, skipping",
                                    ids.len()
                                );
                                return Ok(Vec::new());
                            }
                        }
                        Ok(Err(e)) => last = e.to_string(),
                        Err(_) => last = "request timed out".to_string(),
                    }
                }
                Err(e) => last = e,
            }

            let backoff = match wait_hint {
                Some(hint) => hint.min(self.config.retry_after_cap()),
                None => self.config.backoff(attempt),
            };
            info!(
                kind = %kind,
                "No response from live API ({}), sleeping {:?}",
                last,
                backoff
            );
            sleep(backoff).await;
        }

        warn!(
            kind = %kind,
            "Live API failed after {} attempts, skipping batch: {}",
            self.config.max_attempts,
            last
        );
        Ok(Vec::new())
    }
}
