//! Run-level error type and process exit codes.

use std::fmt;

use crate::backfill::{BackfillError, TokenStoreError};
use crate::config::ConfigError;
use crate::merge::UnmatchedField;
use crate::models::{format_minute, RecordKind};
use crate::transport::TransportError;

/// Anything that ends a run.
#[derive(Debug)]
pub enum MergeError {
    /// Fields the policy tables do not cover.
    SchemaDrift {
        kind: RecordKind,
        minute: i64,
        fields: Vec<UnmatchedField>,
    },
    Backfill(BackfillError),
    Transport(TransportError),
    Config(ConfigError),
}

impl MergeError {
    /// 1 for drift and remote failures, 2 for configuration, 3 for I/O and
    /// decode failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaDrift { .. } => 1,
            Self::Backfill(BackfillError::MissingToken) => 2,
            Self::Backfill(BackfillError::Token(TokenStoreError::Io(_))) => 3,
            Self::Backfill(_) => 1,
            Self::Transport(_) => 3,
            Self::Config(_) => 2,
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaDrift {
                kind,
                minute,
                fields,
            } => {
                write!(
                    f,
                    "{}: {} unmatched field(s) at {}",
                    kind,
                    fields.len(),
                    format_minute(*minute)
                )?;
                for field in fields.iter().take(5) {
                    write!(f, "; {}", field)?;
                }
                Ok(())
            }
            Self::Backfill(e) => write!(f, "backfill failed: {}", e),
            Self::Transport(e) => write!(f, "transport failed: {}", e),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SchemaDrift { .. } => None,
            Self::Backfill(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Config(e) => Some(e),
        }
    }
}

impl From<BackfillError> for MergeError {
    fn from(e: BackfillError) -> Self {
        Self::Backfill(e)
    }
}

impl From<TransportError> for MergeError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ConfigError> for MergeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
