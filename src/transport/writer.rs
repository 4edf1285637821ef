//! Per-minute output files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{OutputSink, TransportError};
use crate::models::{format_day, format_minute, Record, RecordKind};

const ZSTD_LEVEL: i32 = 3;

/// Writes `{root}/{kind}/{yy-mm-dd}/{RC|RS}_{yy-mm-dd_HH-MM}.zst`.
///
/// Each file is written to `.tmp` and renamed into place once complete, so a
/// crash never leaves a truncated minute under its final name.
#[derive(Debug, Clone)]
pub struct ZstMinuteSink {
    root: PathBuf,
}

impl ZstMinuteSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn minute_path(&self, kind: RecordKind, minute: i64) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(format_day(minute))
            .join(format!("{}_{}.zst", kind.file_prefix(), format_minute(minute)))
    }
}

impl OutputSink for ZstMinuteSink {
    fn write_minute(
        &mut self,
        kind: RecordKind,
        minute: i64,
        records: &[&Record],
    ) -> Result<(), TransportError> {
        let path = self.minute_path(kind, minute);
        if let Some(folder) = path.parent() {
            fs::create_dir_all(folder).map_err(|e| TransportError::io(folder, e))?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = File::create(&tmp_path).map_err(|e| TransportError::io(&tmp_path, e))?;
        let mut encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)
            .map_err(|e| TransportError::io(&tmp_path, e))?;
        for record in records {
            serde_json::to_writer(&mut encoder, &record.fields)
                .map_err(|e| TransportError::io(&tmp_path, e.into()))?;
            encoder
                .write_all(b"\n")
                .map_err(|e| TransportError::io(&tmp_path, e))?;
        }
        let mut inner = encoder
            .finish()
            .map_err(|e| TransportError::io(&tmp_path, e))?;
        inner.flush().map_err(|e| TransportError::io(&tmp_path, e))?;
        drop(inner);

        fs::rename(&tmp_path, &path).map_err(|e| TransportError::io(&path, e))?;
        debug!(path = %path.display(), records = records.len(), "Wrote minute");
        Ok(())
    }
}

/// Keeps written minutes in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub minutes: Vec<(i64, Vec<Record>)>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifiers in write order across every minute.
    pub fn ids(&self) -> Vec<String> {
        self.minutes
            .iter()
            .flat_map(|(_, records)| records.iter().map(|r| r.id().to_string()))
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.minutes.iter().map(|(_, records)| records.len()).sum()
    }
}

impl OutputSink for CollectingSink {
    fn write_minute(
        &mut self,
        _kind: RecordKind,
        minute: i64,
        records: &[&Record],
    ) -> Result<(), TransportError> {
        self.minutes
            .push((minute, records.iter().map(|r| (*r).clone()).collect()));
        Ok(())
    }
}
