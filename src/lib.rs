//! Archive Merge Library
//!
//! Reconciles overlapping observations of comments and submissions from local
//! capture pipelines, fills identifier gaps from remote lookup services and
//! writes one ordered, deduplicated file per minute.

pub mod backfill;
pub mod config;
pub mod error;
pub mod gap;
pub mod ids;
pub mod merge;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use error::MergeError;
pub use models::{Provenance, Record, RecordKind};
