//! Core record types shared by the merge, store and transport layers.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::ids::{base36_decode, is_canonical};

/// Schema-less field dictionary. The policy table in [`crate::merge`] is the schema.
pub type Fields = Map<String, Value>;

/// Seconds per minute bucket.
pub const MINUTE_SECS: i64 = 60;

// =============================================================================
// RECORD KIND
// =============================================================================

/// The two record kinds handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Comment,
    Submission,
}

impl RecordKind {
    /// Folder name used by inputs and outputs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Comment => "comments",
            RecordKind::Submission => "submissions",
        }
    }

    /// Output file prefix.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            RecordKind::Comment => "RC",
            RecordKind::Submission => "RS",
        }
    }

    /// Singular name used in archive API paths.
    pub fn api_name(&self) -> &'static str {
        match self {
            RecordKind::Comment => "comment",
            RecordKind::Submission => "submission",
        }
    }

    /// Fullname prefix used by the live API.
    pub fn fullname_prefix(&self) -> &'static str {
        match self {
            RecordKind::Comment => "t1_",
            RecordKind::Submission => "t3_",
        }
    }

    /// Server-rendered duplicate of the free-text field.
    pub fn html_field(&self) -> &'static str {
        match self {
            RecordKind::Comment => "body_html",
            RecordKind::Submission => "selftext_html",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comments" | "comment" => Ok(RecordKind::Comment),
            "submissions" | "submission" => Ok(RecordKind::Submission),
            other => Err(format!("invalid record type: {}", other)),
        }
    }
}

// =============================================================================
// PROVENANCE
// =============================================================================

/// Where an observation came from. Used for counting and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Primary local capture pipeline.
    Ingest,
    /// Local rescan pipeline.
    Rescan,
    /// Local bulk download pipeline.
    Download,
    /// Historical-archive lookup service.
    Archive,
    /// Live API lookup.
    Backfill,
    /// Confirmed gap, never observed.
    Missing,
}

impl Provenance {
    pub const ALL: [Provenance; 6] = [
        Provenance::Ingest,
        Provenance::Rescan,
        Provenance::Download,
        Provenance::Archive,
        Provenance::Backfill,
        Provenance::Missing,
    ];

    /// Local capture sources, in load priority order.
    pub const LOCAL: [Provenance; 3] = [Provenance::Ingest, Provenance::Rescan, Provenance::Download];

    /// Sources reported after a span is flushed.
    pub const REMOTE: [Provenance; 3] = [Provenance::Archive, Provenance::Backfill, Provenance::Missing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Ingest => "ingest",
            Provenance::Rescan => "rescan",
            Provenance::Download => "download",
            Provenance::Archive => "archive",
            Provenance::Backfill => "backfill",
            Provenance::Missing => "missing",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RECORD
// =============================================================================

/// A single observed or reconciled record.
///
/// `id` and `created_utc` are lifted out of the field map at construction and
/// never change afterwards; bucket membership depends on them.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: String,
    id_num: u64,
    created_utc: i64,
    pub fields: Fields,
    /// Provenance of the last observation merged into this record.
    pub source: Provenance,
}

impl Record {
    /// Build a record from a decoded JSON line or API payload.
    pub fn from_value(value: Value, source: Provenance) -> Result<Self, RecordError> {
        match value {
            Value::Object(fields) => Self::from_fields(fields, source),
            _ => Err(RecordError::NotAnObject),
        }
    }

    pub fn from_fields(fields: Fields, source: Provenance) -> Result<Self, RecordError> {
        let id = match fields.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => return Err(RecordError::InvalidId(other.to_string())),
            None => return Err(RecordError::MissingField("id")),
        };
        // Aliases such as `K10` or `0k10` would collide with `k10` in a bucket.
        if !is_canonical(&id) {
            return Err(RecordError::InvalidId(id));
        }
        let id_num = base36_decode(&id).ok_or_else(|| RecordError::InvalidId(id.clone()))?;
        let created_utc = match fields.get("created_utc") {
            Some(v) => timestamp_of(v).ok_or_else(|| RecordError::InvalidCreated {
                id: id.clone(),
                value: v.to_string(),
            })?,
            None => return Err(RecordError::MissingField("created_utc")),
        };

        Ok(Self {
            id,
            id_num,
            created_utc,
            fields,
            source,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn id_num(&self) -> u64 {
        self.id_num
    }

    pub fn created_utc(&self) -> i64 {
        self.created_utc
    }

    /// Creation minute (epoch seconds, aligned to 60).
    pub fn minute(&self) -> i64 {
        minute_of(self.created_utc)
    }

    /// Ordering key within a minute bucket.
    pub fn sort_key(&self) -> (i64, u64) {
        (self.created_utc, self.id_num)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Reasons a payload cannot become a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    NotAnObject,
    MissingField(&'static str),
    InvalidId(String),
    InvalidCreated { id: String, value: String },
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "record is not a JSON object"),
            Self::MissingField(field) => write!(f, "record is missing '{}'", field),
            Self::InvalidId(id) => write!(f, "invalid record id: {}", id),
            Self::InvalidCreated { id, value } => {
                write!(f, "record {} has invalid created_utc: {}", id, value)
            }
        }
    }
}

impl std::error::Error for RecordError {}

// =============================================================================
// TIME HELPERS
// =============================================================================

/// Read an epoch-seconds timestamp stored as an integer, float or numeric string.
pub fn timestamp_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

/// Truncate epoch seconds to the start of its minute.
#[inline]
pub fn minute_of(ts: i64) -> i64 {
    ts - ts.rem_euclid(MINUTE_SECS)
}

/// Current time in epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

pub fn minute_datetime(minute: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(minute, 0).unwrap_or_default()
}

/// `yy-mm-dd_HH-MM`, the minute stamp used in file names and logs.
pub fn format_minute(minute: i64) -> String {
    minute_datetime(minute).format("%y-%m-%d_%H-%M").to_string()
}

/// `yy-mm-dd`, the day folder name.
pub fn format_day(minute: i64) -> String {
    minute_datetime(minute).format("%y-%m-%d").to_string()
}

/// Parse a `yy-mm-dd_HH-MM` stamp into epoch seconds.
pub fn parse_minute(stamp: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(stamp, "%y-%m-%d_%H-%M")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}
