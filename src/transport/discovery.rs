//! Input discovery across local capture roots.

use chrono::{Duration as ChronoDuration, NaiveDate};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::reader::read_records;
use super::{MinuteInputs, TransportError};
use crate::config::{ReaderConfig, SourceConfig};
use crate::models::{format_day, minute_datetime, parse_minute, Provenance, Record, RecordKind};

/// Length of a `yy-mm-dd_HH-MM` stamp.
const STAMP_LEN: usize = 14;

/// One input file and the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub provenance: Provenance,
}

/// First `yy-mm-dd_HH-MM` stamp in a file name, as a minute.
pub fn minute_in_name(name: &str) -> Option<i64> {
    let bytes = name.as_bytes();
    if bytes.len() < STAMP_LEN {
        return None;
    }
    (0..=bytes.len() - STAMP_LEN).find_map(|start| {
        let candidate = name.get(start..start + STAMP_LEN)?;
        let shaped = candidate.bytes().enumerate().all(|(i, b)| match i {
            2 | 5 | 11 => b == b'-',
            8 => b == b'_',
            _ => b.is_ascii_digit(),
        });
        if shaped {
            parse_minute(candidate)
        } else {
            None
        }
    })
}

/// Calendar days touched by `[first_minute, last_minute]`.
fn days_between(first_minute: i64, last_minute: i64) -> Vec<NaiveDate> {
    let first = minute_datetime(first_minute).date_naive();
    let last = minute_datetime(last_minute).date_naive();
    let mut days = Vec::new();
    let mut day = first;
    while day <= last {
        days.push(day);
        day += ChronoDuration::days(1);
    }
    days
}

/// Map every file under `{root}/{kind}/{yy-mm-dd}/` of each source onto its
/// minute, keeping only minutes in `[first_minute, last_minute]`.
pub fn discover_inputs(
    sources: &[SourceConfig],
    kind: RecordKind,
    first_minute: i64,
    last_minute: i64,
) -> Result<BTreeMap<i64, Vec<InputFile>>, TransportError> {
    let mut by_minute: BTreeMap<i64, Vec<InputFile>> = BTreeMap::new();
    let days = days_between(first_minute, last_minute);

    for source in sources {
        for day in &days {
            let folder = source
                .root
                .join(kind.as_str())
                .join(day.format("%y-%m-%d").to_string());
            let entries = match fs::read_dir(&folder) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(folder = %folder.display(), "No input folder");
                    continue;
                }
                Err(e) => return Err(TransportError::io(&folder, e)),
            };

            let mut names = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| TransportError::io(&folder, e))?;
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();

            for name in names {
                if name.ends_with(".tmp") {
                    continue;
                }
                let Some(minute) = minute_in_name(&name) else {
                    warn!(kind = %kind, "File doesn't match stamp pattern: {}", name);
                    continue;
                };
                if minute < first_minute || minute > last_minute {
                    continue;
                }
                by_minute.entry(minute).or_default().push(InputFile {
                    path: folder.join(&name),
                    provenance: source.provenance,
                });
            }
        }
    }

    for source in sources {
        info!(
            kind = %kind,
            provenance = %source.provenance,
            "Input folder: {}",
            source.root.display()
        );
    }
    debug!(
        kind = %kind,
        minutes = by_minute.len(),
        from = %format_day(first_minute),
        "Discovered inputs"
    );
    Ok(by_minute)
}

/// Discovered files, read lazily one minute at a time.
pub struct FileInputs {
    files: BTreeMap<i64, Vec<InputFile>>,
    reader: ReaderConfig,
}

impl FileInputs {
    pub fn new(files: BTreeMap<i64, Vec<InputFile>>, reader: ReaderConfig) -> Self {
        Self { files, reader }
    }

    pub fn file_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

impl MinuteInputs for FileInputs {
    fn load_minute(&mut self, minute: i64) -> Result<Vec<Record>, TransportError> {
        let mut records = Vec::new();
        for file in self.files.remove(&minute).unwrap_or_default() {
            records.extend(read_records(&file.path, file.provenance, &self.reader)?);
        }
        Ok(records)
    }
}
