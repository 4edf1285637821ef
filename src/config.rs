//! Run configuration.
//!
//! Loaded in layers: TOML file (`MERGE_CONFIG_PATH` or `--config`), then
//! environment overrides, then command-line flags in `main`. Live API
//! credentials are read from the environment only and never serialized.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Provenance;

/// Configuration errors. Exit code 2.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            Self::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Invalid(_) => None,
        }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Local capture roots, loaded in this order every minute.
    pub sources: Vec<SourceConfig>,

    /// Root of the per-minute output files.
    pub output_root: PathBuf,

    /// Plain-text file holding the archive bearer token.
    pub token_path: PathBuf,

    /// Dense-identifier ranges to skip, as `a-b,c-d` in base 36.
    pub ignore_ids: Option<String>,

    pub scheduler: SchedulerConfig,
    pub reader: ReaderConfig,
    pub archive: ArchiveConfig,
    pub live: LiveConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            sources: SourceConfig::under(Path::new("input")),
            output_root: PathBuf::from("output"),
            token_path: PathBuf::from("archive_token.txt"),
            ignore_ids: None,
            scheduler: SchedulerConfig::default(),
            reader: ReaderConfig::default(),
            archive: ArchiveConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl MergeConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file named by `explicit` or `MERGE_CONFIG_PATH` if any, then
    /// apply environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var("MERGE_CONFIG_PATH").ok().map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load(&path)?,
            None => {
                tracing::debug!("No config file given, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MERGE_OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MERGE_TOKEN_PATH") {
            self.token_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MERGE_IGNORE_IDS") {
            self.ignore_ids = Some(v);
        }
        if let Ok(v) = std::env::var("MERGE_LOOKAHEAD_MINUTES") {
            self.scheduler.lookahead_minutes =
                v.parse().unwrap_or(self.scheduler.lookahead_minutes);
        }
        if let Ok(v) = std::env::var("MERGE_BACKFILL_CONCURRENCY") {
            self.scheduler.backfill_concurrency =
                v.parse().unwrap_or(self.scheduler.backfill_concurrency);
        }
        if let Ok(v) = std::env::var("MERGE_MAX_GAP_SPAN") {
            self.scheduler.max_gap_span = v.parse().unwrap_or(self.scheduler.max_gap_span);
        }
        self.archive.apply_env();
        self.live.apply_env();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no input sources configured".into()));
        }
        if self.scheduler.lookahead_minutes == 0 {
            return Err(ConfigError::Invalid("lookahead_minutes must be at least 1".into()));
        }
        if self.scheduler.max_gap_span == 0 {
            return Err(ConfigError::Invalid("max_gap_span must be at least 1".into()));
        }
        if self.archive.batch_size == 0 || self.live.batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be at least 1".into()));
        }
        if self.reader.chunk_bytes == 0 || self.reader.chunk_bytes > self.reader.max_window_bytes {
            return Err(ConfigError::Invalid(
                "reader chunk_bytes must be between 1 and max_window_bytes".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// One local capture root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub provenance: Provenance,
    pub root: PathBuf,
}

impl SourceConfig {
    /// The three conventional capture roots under `input`: `ingest`,
    /// `rescan` and `download`.
    pub fn under(input: &Path) -> Vec<SourceConfig> {
        Provenance::LOCAL
            .iter()
            .map(|provenance| SourceConfig {
                provenance: *provenance,
                root: input.join(provenance.as_str()),
            })
            .collect()
    }
}

// =============================================================================
// SCHEDULER / READER
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Finalize once this many minutes are buffered.
    pub lookahead_minutes: usize,
    /// Minutes read before and after the run range.
    pub padding_minutes: i64,
    /// Concurrent requests per provider.
    pub backfill_concurrency: usize,
    /// Widest id span a finalized span may enumerate before backfill is
    /// skipped for it.
    pub max_gap_span: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_minutes: 11,
            padding_minutes: 2,
            backfill_concurrency: 1,
            max_gap_span: crate::gap::DEFAULT_MAX_SPAN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Decompressed bytes read per chunk.
    pub chunk_bytes: usize,
    /// Largest window tried before a chunk is declared undecodable.
    pub max_window_bytes: usize,
    /// Malformed JSON lines tolerated per file.
    pub max_bad_lines: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 1 << 27,
            max_window_bytes: 1 << 30,
            max_bad_lines: 100,
        }
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub base_url: String,
    pub auth_url: String,
    pub user_agent: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Sleep after attempt `n` is `n * backoff_step_ms`, capped.
    pub backoff_step_ms: u64,
    pub backoff_cap_ms: u64,
    pub request_timeout_secs: u64,
    /// Wait before reusing a token the auth service says is still active.
    pub still_active_wait_ms: u64,
    /// How long to wait for another run holding the rotation lock.
    pub lock_wait_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.pushshift.io".to_string(),
            auth_url: "https://auth.pushshift.io".to_string(),
            user_agent: "archive-merge/0.1".to_string(),
            batch_size: 50,
            max_attempts: 100,
            backoff_step_ms: 10_000,
            backoff_cap_ms: 300_000,
            request_timeout_secs: 20,
            still_active_wait_ms: 5_000,
            lock_wait_secs: 120,
        }
    }
}

impl ArchiveConfig {
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ARCHIVE_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("ARCHIVE_AUTH_URL") {
            self.auth_url = v;
        }
        if let Ok(v) = std::env::var("ARCHIVE_MAX_ATTEMPTS") {
            self.max_attempts = v.parse().unwrap_or(self.max_attempts);
        }
        if let Ok(v) = std::env::var("ARCHIVE_BACKOFF_STEP_MS") {
            self.backoff_step_ms = v.parse().unwrap_or(self.backoff_step_ms);
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis((attempt as u64 * self.backoff_step_ms).min(self.backoff_cap_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// OAuth password-grant credentials. Environment only.
#[derive(Clone, Default)]
pub struct LiveCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LiveCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl LiveCredentials {
    /// `LIVE_CLIENT_ID`, `LIVE_CLIENT_SECRET`, `LIVE_USERNAME`, `LIVE_PASSWORD`.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            client_id: var("LIVE_CLIENT_ID")?,
            client_secret: var("LIVE_CLIENT_SECRET")?,
            username: var("LIVE_USERNAME")?,
            password: var("LIVE_PASSWORD")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub enabled: bool,
    pub api_url: String,
    pub token_url: String,
    pub user_agent: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Sleep after attempt `n` is `n * backoff_step_ms`.
    pub backoff_step_ms: u64,
    /// Longest `Retry-After` honored on a 429.
    pub retry_after_cap_ms: u64,
    pub request_timeout_secs: u64,
    #[serde(skip)]
    pub credentials: Option<LiveCredentials>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "https://oauth.reddit.com".to_string(),
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            user_agent: "archive-merge/0.1".to_string(),
            batch_size: 100,
            max_attempts: 20,
            backoff_step_ms: 5_000,
            retry_after_cap_ms: 60_000,
            request_timeout_secs: 30,
            credentials: None,
        }
    }
}

impl LiveConfig {
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LIVE_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("LIVE_TOKEN_URL") {
            self.token_url = v;
        }
        if let Ok(v) = std::env::var("LIVE_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(credentials) = LiveCredentials::from_env() {
            self.credentials = Some(credentials);
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(attempt as u64 * self.backoff_step_ms)
    }

    pub fn retry_after_cap(&self) -> Duration {
        Duration::from_millis(self.retry_after_cap_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_protocol_limits() {
        let config = MergeConfig::default();
        assert_eq!(config.archive.batch_size, 50);
        assert_eq!(config.live.batch_size, 100);
        assert_eq!(config.live.max_attempts, 20);
        assert_eq!(config.scheduler.lookahead_minutes, 11);
        assert_eq!(config.scheduler.padding_minutes, 2);
        assert_eq!(config.scheduler.max_gap_span, 1_000_000);
        assert_eq!(config.sources.len(), 3);
        assert!(config.sources[1].root.ends_with("rescan"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("merge.toml");
        std::fs::write(
            &path,
            r#"
output_root = "/data/out"

[archive]
batch_size = 25

[[sources]]
provenance = "rescan"
root = "/data/rescan"
"#,
        )
        .unwrap();

        let config = MergeConfig::load(&path).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/data/out"));
        assert_eq!(config.archive.batch_size, 25);
        assert_eq!(config.archive.max_attempts, 100);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].provenance, Provenance::Rescan);
        assert!(config.live.credentials.is_none());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "lookahead = [").unwrap();
        assert!(matches!(MergeConfig::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            MergeConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_archive_backoff_is_linear_and_capped() {
        let archive = ArchiveConfig {
            backoff_step_ms: 10,
            backoff_cap_ms: 25,
            ..ArchiveConfig::default()
        };
        assert_eq!(archive.backoff(0), Duration::ZERO);
        assert_eq!(archive.backoff(2), Duration::from_millis(20));
        assert_eq!(archive.backoff(9), Duration::from_millis(25));
    }

    #[test]
    fn test_validate_rejects_bad_reader_window() {
        let mut config = MergeConfig::default();
        config.reader.chunk_bytes = config.reader.max_window_bytes + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_gap_span() {
        let mut config = MergeConfig::default();
        config.scheduler.max_gap_span = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
