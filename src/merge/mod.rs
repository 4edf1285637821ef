//! Field-level reconciliation of overlapping record observations.
//!
//! The [`FieldMerger`] applies the per-kind policy tables in [`policy`] in two
//! situations:
//!
//! - **First observation** ([`FieldMerger::initialize_new`]): strips fields
//!   that must never be archived, normalizes legacy field names and blanks the
//!   viewer-specific fields, so every remaining field has a deterministic rule
//!   for later merges.
//! - **Later observations** ([`FieldMerger::merge_into`]): combines an incoming
//!   observation into the stored record in place, field by field.
//!
//! Both report every field the tables do not cover. The caller treats any such
//! field as schema drift and halts; the merger itself never drops data
//! silently.

pub mod policy;

use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use tracing::info;

use crate::models::{timestamp_of, Record, RecordKind};

pub use policy::{field_action, special_blank, FieldAction};

/// Values accepted for `removal_reason`, at ingest and on merge.
const ALLOWED_REMOVAL_REASON: &str = "legal";

// =============================================================================
// EMPTY SENTINELS
// =============================================================================

/// The empty-sentinel set: null, "", "[deleted]", "[removed]", [], {}, false, 0.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "[deleted]" || s == "[removed]",
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Decode the entity escapes the capture pipelines disagree on.
pub fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (decoded, consumed) = if tail.starts_with("&amp;") {
            ('&', 5)
        } else if tail.starts_with("&lt;") {
            ('<', 4)
        } else if tail.starts_with("&gt;") {
            ('>', 4)
        } else {
            ('&', 1)
        };
        out.push(decoded);
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Whether two observations of a field carry the same information.
fn values_equivalent(existing: &Value, incoming: &Value) -> bool {
    if existing == incoming {
        return true;
    }
    match (existing, incoming) {
        (Value::String(a), Value::String(b)) => decode_entities(a) == decode_entities(b),
        (Value::Number(a), Value::Number(b)) => {
            matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
        }
        _ => false,
    }
}

fn is_allowed_removal_reason(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s == ALLOWED_REMOVAL_REASON,
        _ => false,
    }
}

// =============================================================================
// MERGE REPORT
// =============================================================================

/// Why a field could not be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// The field has no entry in the policy table.
    NoPolicy,
    /// An empty-only field carried a value.
    NotEmpty,
    /// A special field hit a case with no rule.
    UncoveredSpecial,
    /// Two observations of an as-is field disagree.
    Conflict,
}

impl UnmatchedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPolicy => "no policy",
            Self::NotEmpty => "not empty",
            Self::UncoveredSpecial => "uncovered special",
            Self::Conflict => "conflict",
        }
    }
}

/// Full context for a field the policy could not handle.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedField {
    pub id: String,
    pub field: String,
    pub reason: UnmatchedReason,
    pub existing: Option<Value>,
    pub incoming: Value,
}

impl fmt::Display for UnmatchedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.existing {
            Some(existing) => write!(
                f,
                "{} {} ({}): {} != {}",
                self.id,
                self.field,
                self.reason.as_str(),
                existing,
                self.incoming
            ),
            None => write!(
                f,
                "{} {} ({}): {}",
                self.id,
                self.field,
                self.reason.as_str(),
                self.incoming
            ),
        }
    }
}

/// Outcome of one merger call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Number of fields whose stored value changed.
    pub changed: usize,
    pub unmatched: Vec<UnmatchedField>,
}

impl MergeReport {
    /// True when any field was not covered by the policy. Fatal for the run.
    pub fn is_unmatched(&self) -> bool {
        !self.unmatched.is_empty()
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.changed += other.changed;
        self.unmatched.extend(other.unmatched);
    }

    fn flag(
        &mut self,
        id: &str,
        field: &str,
        reason: UnmatchedReason,
        existing: Option<&Value>,
        incoming: &Value,
    ) {
        let unmatched = UnmatchedField {
            id: id.to_string(),
            field: field.to_string(),
            reason,
            existing: existing.cloned(),
            incoming: incoming.clone(),
        };
        info!("{}", unmatched);
        self.unmatched.push(unmatched);
    }
}

// =============================================================================
// FIELD MERGER
// =============================================================================

/// Policy engine for one record kind.
#[derive(Debug, Clone, Copy)]
pub struct FieldMerger {
    kind: RecordKind,
}

impl FieldMerger {
    pub fn new(kind: RecordKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Normalize a first observation in place.
    ///
    /// `now` stamps `retrieved_on` when the observation carries no retrieval
    /// time.
    pub fn initialize_new(&self, record: &mut Record, now: i64) -> MergeReport {
        let mut report = MergeReport::default();
        let mut removals: Vec<String> = Vec::new();
        let mut blanks: Vec<(String, Value)> = Vec::new();
        let mut renames: Vec<(String, &'static str)> = Vec::new();
        let id = record.id().to_string();

        for (key, value) in record.fields.iter() {
            match field_action(self.kind, key) {
                None => report.flag(&id, key, UnmatchedReason::NoPolicy, None, value),
                Some(FieldAction::DeleteOnIngest) => removals.push(key.clone()),
                Some(FieldAction::AllowOnlyIfEmpty) => {
                    if !is_empty(value) {
                        report.flag(&id, key, UnmatchedReason::NotEmpty, None, value);
                    }
                    removals.push(key.clone());
                }
                Some(FieldAction::SpecialRule) => match key.as_str() {
                    "retrieved_on" | "updated_on" | "body" | "selftext" | "score" => {}
                    "removal_reason" if is_allowed_removal_reason(value) => {}
                    "retrieved_utc" => renames.push((key.clone(), "retrieved_on")),
                    "updated_utc" => renames.push((key.clone(), "updated_on")),
                    _ => {
                        report.flag(&id, key, UnmatchedReason::UncoveredSpecial, None, value);
                        removals.push(key.clone());
                    }
                },
                Some(FieldAction::SpecialNoOverwrite) => match special_blank(key) {
                    Some(blank) => blanks.push((key.clone(), blank)),
                    None => {
                        report.flag(&id, key, UnmatchedReason::UncoveredSpecial, None, value);
                        removals.push(key.clone());
                    }
                },
                Some(_) => {}
            }
        }

        for key in removals {
            record.fields.remove(&key);
        }
        for (key, blank) in blanks {
            record.fields.insert(key, blank);
        }
        for (from, to) in renames {
            if let Some(value) = record.fields.remove(&from) {
                record.fields.insert(to.to_string(), value);
            }
        }
        if !record.fields.contains_key("retrieved_on") {
            record.fields.insert("retrieved_on".to_string(), Value::from(now));
        }

        report
    }

    /// Merge a later observation into the stored record in place.
    pub fn merge_into(&self, existing: &mut Record, incoming: &Record) -> MergeReport {
        let mut report = MergeReport::default();
        let id = existing.id().to_string();

        for (key, new_value) in incoming.fields.iter() {
            let action = field_action(self.kind, key);
            let original = existing.fields.get(key).cloned();
            let original_or_null = original.as_ref().unwrap_or(&Value::Null);

            if values_equivalent(original_or_null, new_value) {
                if action.is_none() {
                    report.flag(&id, key, UnmatchedReason::NoPolicy, original.as_ref(), new_value);
                }
                continue;
            }

            match action {
                None => {
                    report.flag(&id, key, UnmatchedReason::NoPolicy, original.as_ref(), new_value)
                }
                Some(FieldAction::Overwrite) => set(existing, &mut report, key, new_value),
                Some(FieldAction::OverwriteIfIncomingNonEmpty) => {
                    if !is_empty(new_value) {
                        set(existing, &mut report, key, new_value);
                    }
                }
                Some(FieldAction::OverwriteIfExistingEmpty) => {
                    if is_empty(original_or_null) {
                        set(existing, &mut report, key, new_value);
                    }
                }
                Some(FieldAction::NeverOverwrite)
                | Some(FieldAction::DeleteOnIngest)
                | Some(FieldAction::SpecialNoOverwrite) => {}
                Some(FieldAction::AllowOnlyIfEmpty) => {
                    if !is_empty(new_value) {
                        report.flag(&id, key, UnmatchedReason::NotEmpty, original.as_ref(), new_value);
                    }
                }
                Some(FieldAction::AllowAsIs) => {
                    if is_empty(original_or_null) {
                        set(existing, &mut report, key, new_value);
                    } else {
                        report.flag(&id, key, UnmatchedReason::Conflict, original.as_ref(), new_value);
                    }
                }
                Some(FieldAction::SpecialRule) => {
                    self.merge_special(existing, &mut report, key, original.as_ref(), new_value)
                }
            }
        }

        if report.changed > 0 {
            existing.source = incoming.source;
        }
        report
    }

    fn merge_special(
        &self,
        existing: &mut Record,
        report: &mut MergeReport,
        key: &str,
        original: Option<&Value>,
        new_value: &Value,
    ) {
        let id = existing.id().to_string();
        let original_or_null = original.cloned().unwrap_or(Value::Null);

        match key {
            "body" => {
                if !is_empty(new_value) {
                    if existing.fields.contains_key("previous_body") {
                        set(existing, report, "previous_body", &original_or_null);
                    }
                    set(existing, report, key, new_value);
                }
            }
            "selftext" => {
                if !is_empty(new_value) {
                    set(existing, report, "previous_selftext", &original_or_null);
                    set(existing, report, key, new_value);
                }
            }
            "score" => {
                if is_empty(new_value) {
                    return;
                }
                let Some(incoming_score) = new_value.as_f64() else {
                    report.flag(&id, key, UnmatchedReason::UncoveredSpecial, original, new_value);
                    return;
                };
                let replace = is_empty(&original_or_null)
                    || original_or_null
                        .as_f64()
                        .map_or(true, |current| incoming_score.abs() > current.abs());
                if replace {
                    set(existing, report, key, new_value);
                }
            }
            "removal_reason" if is_allowed_removal_reason(new_value) => {
                set(existing, report, key, new_value);
            }
            "retrieved_on" | "retrieved_utc" => {
                let Some(retrieved) = timestamp_of(new_value) else {
                    report.flag(&id, key, UnmatchedReason::UncoveredSpecial, original, new_value);
                    return;
                };
                match existing.fields.get("retrieved_on").and_then(timestamp_of) {
                    Some(previous) if retrieved < previous => {
                        set(existing, report, "retrieved_on", &Value::from(retrieved));
                        bump_updated(existing, report, previous);
                    }
                    Some(previous) if retrieved > previous => {
                        bump_updated(existing, report, retrieved);
                    }
                    Some(_) => {}
                    None => set(existing, report, "retrieved_on", &Value::from(retrieved)),
                }
            }
            "updated_on" | "updated_utc" => match timestamp_of(new_value) {
                Some(updated) => bump_updated(existing, report, updated),
                None => {
                    report.flag(&id, key, UnmatchedReason::UncoveredSpecial, original, new_value)
                }
            },
            _ => report.flag(&id, key, UnmatchedReason::UncoveredSpecial, original, new_value),
        }
    }
}

fn set(record: &mut Record, report: &mut MergeReport, key: &str, value: &Value) {
    let previous = record.fields.insert(key.to_string(), value.clone());
    if previous.as_ref() != Some(value) {
        report.changed += 1;
    }
}

/// `updated_on` only moves forward.
fn bump_updated(record: &mut Record, report: &mut MergeReport, candidate: i64) {
    let current = record.fields.get("updated_on").and_then(timestamp_of);
    if current.map_or(true, |current| candidate > current) {
        set(record, report, "updated_on", &Value::from(candidate));
    }
}
