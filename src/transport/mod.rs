//! Record transport: compressed newline-delimited JSON files on disk.
//!
//! - [`reader`]: chunked zstd line reader with a growing UTF-8 window
//! - [`writer`]: one output file per finalized minute
//! - [`discovery`]: maps per-source day folders onto minutes
//!
//! The scheduler only sees the [`MinuteInputs`] and [`OutputSink`] seams.

pub mod discovery;
pub mod reader;
pub mod writer;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::models::{Record, RecordKind};

pub use discovery::{discover_inputs, FileInputs, InputFile};
pub use reader::{read_records, ZstLines};
pub use writer::{CollectingSink, ZstMinuteSink};

/// I/O and decode failures. Exit code 3.
#[derive(Debug)]
pub enum TransportError {
    Io { path: PathBuf, source: io::Error },
    /// A chunk stayed undecodable as UTF-8 up to the window cap.
    Utf8Window { path: PathBuf, bytes_read: usize },
    /// More malformed lines than the reader tolerates.
    TooManyBadLines { path: PathBuf, count: usize },
}

impl TransportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            Self::Utf8Window { path, bytes_read } => write!(
                f,
                "{}: unable to decode frame after reading {} bytes",
                path.display(),
                bytes_read
            ),
            Self::TooManyBadLines { path, count } => {
                write!(f, "{}: {} malformed lines", path.display(), count)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Per-minute input for one record kind.
pub trait MinuteInputs {
    /// Every record observed for `minute`, across all local sources.
    fn load_minute(&mut self, minute: i64) -> Result<Vec<Record>, TransportError>;
}

/// Destination for finalized minutes.
pub trait OutputSink {
    /// Write one minute's records, already in flush order. Called for empty
    /// minutes too.
    fn write_minute(
        &mut self,
        kind: RecordKind,
        minute: i64,
        records: &[&Record],
    ) -> Result<(), TransportError>;
}

/// Inputs held in memory, keyed by minute.
#[derive(Debug, Default)]
pub struct MemoryInputs {
    minutes: BTreeMap<i64, Vec<Record>>,
}

impl MemoryInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `record` under the file minute `minute`.
    pub fn push(&mut self, minute: i64, record: Record) {
        self.minutes.entry(minute).or_default().push(record);
    }
}

impl MinuteInputs for MemoryInputs {
    fn load_minute(&mut self, minute: i64) -> Result<Vec<Record>, TransportError> {
        Ok(self.minutes.remove(&minute).unwrap_or_default())
    }
}
