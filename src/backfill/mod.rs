//! Remote lookups that fill identifier gaps.
//!
//! Two providers with different contracts sit behind [`BackfillProvider`]:
//!
//! - [`archive::HistoricalArchiveClient`]: bearer-token search API. Token
//!   rotation is coordinated through a [`token::TokenStore`]; exhausting its
//!   retries ends the run.
//! - [`live::LiveApiClient`]: OAuth password-grant info API. Failures degrade
//!   to an empty batch.
//!
//! [`Backfiller`] runs the providers in order for a finalized span and feeds
//! everything they return back through [`RecordStore::add`].

pub mod archive;
pub mod live;
pub mod token;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::gap::batches;
use crate::ids::base36_decode;
use crate::merge::MergeReport;
use crate::models::{Provenance, Record, RecordKind};
use crate::store::{GapScan, RecordStore};

pub use archive::HistoricalArchiveClient;
pub use live::LiveApiClient;
pub use token::{FileTokenStore, MemoryTokenStore, TokenStore, TokenStoreError};

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal backfill failures. Transient errors are retried inside providers.
#[derive(Debug)]
pub enum BackfillError {
    /// No archive token was configured or persisted.
    MissingToken,
    /// The auth service refused to rotate an expired token.
    AuthRejected(String),
    /// Every attempt for a batch failed.
    RetriesExhausted {
        provider: &'static str,
        attempts: u32,
        last: String,
    },
    Token(TokenStoreError),
    Http(reqwest::Error),
}

impl fmt::Display for BackfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingToken => write!(f, "no archive token available"),
            Self::AuthRejected(detail) => write!(f, "archive token refresh failed: {}", detail),
            Self::RetriesExhausted {
                provider,
                attempts,
                last,
            } => write!(
                f,
                "{} lookup failed after {} attempts: {}",
                provider, attempts, last
            ),
            Self::Token(e) => write!(f, "{}", e),
            Self::Http(e) => write!(f, "HTTP error: {}", e),
        }
    }
}

impl std::error::Error for BackfillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Token(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TokenStoreError> for BackfillError {
    fn from(e: TokenStoreError) -> Self {
        Self::Token(e)
    }
}

impl From<reqwest::Error> for BackfillError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

/// A remote source that can look records up by identifier.
#[async_trait]
pub trait BackfillProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Provenance tag for records this provider returns.
    fn provenance(&self) -> Provenance;

    /// Most identifiers one request may carry.
    fn batch_limit(&self) -> usize;

    /// Fetch whichever of `ids` the provider knows about, as raw payloads.
    async fn lookup(&self, kind: RecordKind, ids: &[String]) -> Result<Vec<Value>, BackfillError>;
}

/// Drop the HTML duplicates and stamp the retrieval time on a provider payload.
///
/// With `always_stamp` unset an existing `retrieved_on` is kept.
pub(crate) fn prepare_payload(value: Value, now: i64, always_stamp: bool) -> Value {
    match value {
        Value::Object(mut fields) => {
            fields.remove("body_html");
            fields.remove("selftext_html");
            if always_stamp || !fields.contains_key("retrieved_on") {
                fields.insert("retrieved_on".to_string(), Value::from(now));
            }
            Value::Object(fields)
        }
        other => other,
    }
}

// =============================================================================
// ORCHESTRATION
// =============================================================================

/// What one span's backfill produced.
#[derive(Debug, Default)]
pub struct BackfillOutcome {
    /// Payloads returned per provider.
    pub fetched: Vec<(Provenance, usize)>,
    /// Identifiers still absent after every provider.
    pub still_missing: usize,
    /// Of those, how many fell strictly inside a bucket's bounds.
    pub confirmed_missing: usize,
    pub report: MergeReport,
}

/// Runs providers in order against a span's missing identifiers.
pub struct Backfiller {
    providers: Vec<Arc<dyn BackfillProvider>>,
    concurrency: usize,
}

impl Backfiller {
    pub fn new(providers: Vec<Arc<dyn BackfillProvider>>, concurrency: usize) -> Self {
        Self {
            providers,
            concurrency: concurrency.max(1),
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = &dyn BackfillProvider> {
        self.providers.iter().map(|p| p.as_ref())
    }

    /// Look up `scan.missing` with each provider, merge the results and mark
    /// what is still absent as confirmed gaps.
    pub async fn fill(
        &self,
        store: &mut RecordStore,
        scan: &GapScan,
    ) -> Result<BackfillOutcome, BackfillError> {
        let kind = store.kind();
        let mut outcome = BackfillOutcome::default();
        if scan.missing.is_empty() {
            return Ok(outcome);
        }

        for provider in &self.providers {
            let provider = provider.as_ref();
            let mut fetched = 0usize;
            let mut results = stream::iter(batches(&scan.missing, provider.batch_limit()))
                .map(|batch| provider.lookup(kind, batch))
                .buffered(self.concurrency);

            while let Some(result) = results.next().await {
                for value in result? {
                    fetched += 1;
                    match Record::from_value(value, provider.provenance()) {
                        Ok(record) => outcome.report.absorb(store.add(record)),
                        Err(e) => warn!(provider = provider.name(), "Skipping payload: {}", e),
                    }
                }
            }
            debug!(
                provider = provider.name(),
                kind = %kind,
                requested = scan.missing.len(),
                fetched,
                "Provider pass complete"
            );
            outcome.fetched.push((provider.provenance(), fetched));
        }

        for id in &scan.missing {
            if store.contains(id) {
                continue;
            }
            outcome.still_missing += 1;
            let Some(id_num) = base36_decode(id) else {
                continue;
            };
            if let Some(minute) = store.bucket_containing(id_num) {
                if store.mark_missing(id_num, minute) {
                    outcome.confirmed_missing += 1;
                }
            }
        }
        if outcome.still_missing > 0 {
            info!(
                kind = %kind,
                still_missing = outcome.still_missing,
                confirmed = outcome.confirmed_missing,
                "Ids not found by any provider"
            );
        }

        Ok(outcome)
    }
}
