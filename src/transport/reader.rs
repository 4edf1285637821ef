//! Chunked reader for zstd-compressed newline-delimited JSON.
//!
//! Decompressed bytes are read in fixed-size chunks. A chunk can end inside a
//! multi-byte character (or hold a genuinely bad frame); in that case more
//! chunks are appended and decoding retried until the window passes the cap.

use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::TransportError;
use crate::config::ReaderConfig;
use crate::models::{Provenance, Record};

/// Non-empty lines of a decompressed stream.
pub struct ZstLines<R: Read> {
    reader: R,
    path: PathBuf,
    chunk_bytes: usize,
    max_window_bytes: usize,
    partial: String,
    ready: VecDeque<String>,
    finished: bool,
}

impl ZstLines<zstd::stream::read::Decoder<'static, BufReader<File>>> {
    /// Open a `.zst` file.
    pub fn open(path: &Path, config: &ReaderConfig) -> Result<Self, TransportError> {
        let file = File::open(path).map_err(|e| TransportError::io(path, e))?;
        let mut decoder =
            zstd::stream::read::Decoder::new(file).map_err(|e| TransportError::io(path, e))?;
        decoder
            .window_log_max(31)
            .map_err(|e| TransportError::io(path, e))?;
        Ok(Self::new(decoder, path, config))
    }
}

impl<R: Read> ZstLines<R> {
    /// Wrap an already-decompressing reader. `path` is only used in errors.
    pub fn new(reader: R, path: &Path, config: &ReaderConfig) -> Self {
        Self {
            reader,
            path: path.to_path_buf(),
            chunk_bytes: config.chunk_bytes.max(1),
            max_window_bytes: config.max_window_bytes,
            partial: String::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Read up to one chunk. Returns the number of bytes appended.
    fn read_chunk(&mut self, window: &mut Vec<u8>) -> Result<usize, TransportError> {
        let before = window.len();
        (&mut self.reader)
            .take(self.chunk_bytes as u64)
            .read_to_end(window)
            .map_err(|e| TransportError::io(&self.path, e))?;
        Ok(window.len() - before)
    }

    /// Decode the next chunk, widening the window on UTF-8 failure.
    /// `None` at end of stream.
    fn next_text(&mut self) -> Result<Option<String>, TransportError> {
        let mut window = Vec::new();
        let mut bytes_read = 0usize;
        loop {
            let read = self.read_chunk(&mut window)?;
            bytes_read += self.chunk_bytes;
            if window.is_empty() {
                return Ok(None);
            }
            match String::from_utf8(window) {
                Ok(text) => return Ok(Some(text)),
                Err(e) => {
                    if read == 0 || bytes_read > self.max_window_bytes {
                        return Err(TransportError::Utf8Window {
                            path: self.path.clone(),
                            bytes_read,
                        });
                    }
                    debug!(path = %self.path.display(), bytes_read, "Widening decode window");
                    window = e.into_bytes();
                }
            }
        }
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        while self.ready.is_empty() && !self.finished {
            match self.next_text()? {
                Some(text) => {
                    self.partial.push_str(&text);
                    if let Some(last_newline) = self.partial.rfind('\n') {
                        let rest = self.partial.split_off(last_newline + 1);
                        let complete = std::mem::replace(&mut self.partial, rest);
                        self.ready.extend(
                            complete
                                .split('\n')
                                .map(str::trim)
                                .filter(|line| !line.is_empty())
                                .map(str::to_string),
                        );
                    }
                }
                None => {
                    self.finished = true;
                    let tail = std::mem::take(&mut self.partial);
                    let tail = tail.trim();
                    if !tail.is_empty() {
                        self.ready.push_back(tail.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ZstLines<R> {
    type Item = Result<String, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.finished = true;
            self.ready.clear();
            return Some(Err(e));
        }
        self.ready.pop_front().map(Ok)
    }
}

/// Parse every line of `lines` into a [`Record`] tagged `provenance`.
///
/// Lines that are not JSON, or JSON that is not a usable record, are skipped
/// with a warning; more than `max_bad_lines` of them fails the file.
pub fn parse_lines<R: Read>(
    lines: ZstLines<R>,
    provenance: Provenance,
    max_bad_lines: usize,
) -> Result<Vec<Record>, TransportError> {
    let path = lines.path.clone();
    let mut records = Vec::new();
    let mut bad_lines = 0usize;

    for line in lines {
        let line = line?;
        let parsed = serde_json::from_str::<Value>(&line)
            .map_err(|e| e.to_string())
            .and_then(|value| Record::from_value(value, provenance).map_err(|e| e.to_string()));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => {
                bad_lines += 1;
                warn!(path = %path.display(), "Skipping malformed line: {}", e);
                if bad_lines > max_bad_lines {
                    return Err(TransportError::TooManyBadLines {
                        path,
                        count: bad_lines,
                    });
                }
            }
        }
    }
    Ok(records)
}

/// Read and parse a whole `.zst` file.
pub fn read_records(
    path: &Path,
    provenance: Provenance,
    config: &ReaderConfig,
) -> Result<Vec<Record>, TransportError> {
    parse_lines(ZstLines::open(path, config)?, provenance, config.max_bad_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::tempdir;

    fn small(chunk_bytes: usize, max_window_bytes: usize) -> ReaderConfig {
        ReaderConfig {
            chunk_bytes,
            max_window_bytes,
            max_bad_lines: 1,
        }
    }

    fn lines_of(text: &[u8], config: &ReaderConfig) -> Result<Vec<String>, TransportError> {
        ZstLines::new(Cursor::new(text.to_vec()), Path::new("mem"), config).collect()
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let text = b"{\"a\":1}\n\n{\"b\":2}\n{\"c\":3}";
        let lines = lines_of(text, &small(4, 64)).unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[test]
    fn test_multibyte_character_on_chunk_boundary() {
        let text = "ab\u{00e9}cd\n\u{1F600}\n".as_bytes();
        for chunk in 1..6 {
            let lines = lines_of(text, &small(chunk, 64)).unwrap();
            assert_eq!(lines, vec!["ab\u{00e9}cd", "\u{1F600}"], "chunk {}", chunk);
        }
    }

    #[test]
    fn test_invalid_utf8_fails_after_window() {
        let mut text = b"ok\n".to_vec();
        text.extend_from_slice(&[0xff, 0xfe]);
        text.extend_from_slice(b"aaaaaaaaaaaaaaaa\n");
        let result = lines_of(&text, &small(4, 12));
        assert!(matches!(result, Err(TransportError::Utf8Window { .. })));
    }

    #[test]
    fn test_read_records_from_zst_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("RC_23-04-05_13-07.zst");
        let mut encoder = zstd::stream::write::Encoder::new(File::create(&path).unwrap(), 3).unwrap();
        writeln!(encoder, "{{\"id\":\"a1\",\"created_utc\":1680700020}}").unwrap();
        writeln!(encoder, "not json").unwrap();
        writeln!(encoder, "{{\"id\":\"a2\",\"created_utc\":1680700021}}").unwrap();
        encoder.finish().unwrap();

        let records = read_records(&path, Provenance::Rescan, &small(16, 1024)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id(), "a2");
        assert_eq!(records[0].source, Provenance::Rescan);
    }

    #[test]
    fn test_too_many_bad_lines() {
        let config = small(64, 1024);
        let lines = ZstLines::new(
            Cursor::new(b"x\n{\"id\":\"a\"}\n".to_vec()),
            Path::new("mem"),
            &config,
        );
        let result = parse_lines(lines, Provenance::Ingest, config.max_bad_lines);
        assert!(matches!(result, Err(TransportError::TooManyBadLines { count: 2, .. })));
    }
}
