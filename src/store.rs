//! In-memory index of reconciled records for one processing run.
//!
//! Records are indexed twice: by identifier for merging, and by creation
//! minute for gap detection and ordered flushing. Each [`MinuteBucket`] keeps
//! its members ordered by (creation time, dense identifier) and tracks the
//! lowest and highest dense identifier it has seen.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::ids::{base36_encode, IdRange};
use crate::merge::{FieldMerger, MergeReport};
use crate::models::{format_minute, minute_of, now_epoch, Provenance, Record, RecordKind};

// =============================================================================
// MINUTE BUCKET
// =============================================================================

/// Identifiers created within one minute, in flush order.
#[derive(Debug, Clone, Default)]
pub struct MinuteBucket {
    members: BTreeMap<(i64, u64), String>,
    min_id: Option<u64>,
    max_id: Option<u64>,
}

impl MinuteBucket {
    fn insert(&mut self, record: &Record) {
        let id_num = record.id_num();
        self.min_id = Some(self.min_id.map_or(id_num, |min| min.min(id_num)));
        self.max_id = Some(self.max_id.map_or(id_num, |max| max.max(id_num)));
        self.members.insert(record.sort_key(), record.id().to_string());
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn min_id(&self) -> Option<u64> {
        self.min_id
    }

    pub fn max_id(&self) -> Option<u64> {
        self.max_id
    }

    /// Whether `id_num` lies strictly between the bucket's bounds.
    pub fn straddles(&self, id_num: u64) -> bool {
        matches!((self.min_id, self.max_id), (Some(min), Some(max)) if min < id_num && id_num < max)
    }

    /// Member identifiers in (creation time, dense identifier) order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.values().map(String::as_str)
    }
}

// =============================================================================
// COUNTS
// =============================================================================

/// Per-source tally: records first seen vs. merged into an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounts {
    pub new: u64,
    pub merged: u64,
}

type MinuteCounts = BTreeMap<Provenance, SourceCounts>;

fn counts_string(counts: Option<&MinuteCounts>, sources: &[Provenance]) -> String {
    sources
        .iter()
        .map(|source| {
            let c = counts.and_then(|c| c.get(source)).copied().unwrap_or_default();
            format!("{}({})", c.new, c.merged)
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Result of enumerating a finalized span's identifier range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapScan {
    /// Base-36 identifiers in `[low, high]` absent from the index.
    pub missing: Vec<String>,
    pub low: u64,
    pub high: u64,
    /// Identifiers skipped because they fall in an ignore range.
    pub ignored: u64,
}

// =============================================================================
// RECORD STORE
// =============================================================================

/// Reconciled records for the range `[start, end)` of one run.
pub struct RecordStore {
    kind: RecordKind,
    merger: FieldMerger,
    start: i64,
    end: i64,
    watermark: i64,
    by_id: HashMap<String, Record>,
    by_minute: BTreeMap<i64, MinuteBucket>,
    counts: BTreeMap<i64, MinuteCounts>,
    out_of_range: u64,
    late: u64,
}

impl RecordStore {
    /// `start` and `end` are epoch seconds; `end` is exclusive.
    pub fn new(kind: RecordKind, start: i64, end: i64) -> Self {
        Self {
            kind,
            merger: FieldMerger::new(kind),
            start,
            end,
            watermark: minute_of(start),
            by_id: HashMap::new(),
            by_minute: BTreeMap::new(),
            counts: BTreeMap::new(),
            out_of_range: 0,
            late: 0,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Lowest minute not yet finalized.
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id)
    }

    pub fn bucket(&self, minute: i64) -> Option<&MinuteBucket> {
        self.by_minute.get(&minute)
    }

    /// Number of minutes currently buffered.
    pub fn count_minutes(&self) -> usize {
        self.by_minute.len()
    }

    pub fn out_of_range(&self) -> u64 {
        self.out_of_range
    }

    pub fn late_drops(&self) -> u64 {
        self.late
    }

    /// Merge or insert one observation, tagged with `record.source`.
    pub fn add(&mut self, mut record: Record) -> MergeReport {
        let source = record.source;

        if let Some(existing) = self.by_id.get_mut(record.id()) {
            let report = self.merger.merge_into(existing, &record);
            let minute = existing.minute();
            self.tally(minute, source).merged += 1;
            return report;
        }

        let created = record.created_utc();
        if created < self.start || created >= self.end {
            self.out_of_range += 1;
            return MergeReport::default();
        }

        let minute = record.minute();
        if minute < self.watermark {
            warn!(
                kind = %self.kind,
                id = record.id(),
                source = %source,
                minute = %format_minute(minute),
                "Dropping late record below watermark {}",
                format_minute(self.watermark)
            );
            self.late += 1;
            return MergeReport::default();
        }

        let report = self.merger.initialize_new(&mut record, now_epoch());
        self.by_minute.entry(minute).or_default().insert(&record);
        self.tally(minute, source).new += 1;
        self.by_id.insert(record.id().to_string(), record);
        report
    }

    fn tally(&mut self, minute: i64, source: Provenance) -> &mut SourceCounts {
        self.counts
            .entry(minute)
            .or_default()
            .entry(source)
            .or_default()
    }

    /// Lowest id of `start_minute` and highest id of `end_minute`, or `None`
    /// when either endpoint bucket is empty.
    pub fn id_bounds(&self, start_minute: i64, end_minute: i64) -> Option<(u64, u64)> {
        let low = self.by_minute.get(&start_minute).and_then(|b| b.min_id);
        let high = self.by_minute.get(&end_minute).and_then(|b| b.max_id);
        match (low, high) {
            (Some(low), Some(high)) => Some((low, high)),
            _ => {
                debug!(
                    kind = %self.kind,
                    start = %format_minute(start_minute),
                    end = %format_minute(end_minute),
                    "No id bounds for span"
                );
                None
            }
        }
    }

    /// Enumerate the identifiers missing between the lowest id of
    /// `start_minute` and the highest id of `end_minute`.
    ///
    /// Returns `None` when either endpoint bucket is empty.
    pub fn missing_ids_in_range(
        &self,
        start_minute: i64,
        end_minute: i64,
        ignore: &[IdRange],
    ) -> Option<GapScan> {
        let (low, high) = self.id_bounds(start_minute, end_minute)?;

        let mut missing = Vec::new();
        let mut ignored = 0u64;
        for id_num in low..=high {
            if ignore.iter().any(|range| range.contains(id_num)) {
                ignored += 1;
                continue;
            }
            let id = base36_encode(id_num);
            if !self.by_id.contains_key(&id) {
                missing.push(id);
            }
        }

        Some(GapScan {
            missing,
            low,
            high,
            ignored,
        })
    }

    /// Records of one minute in flush order.
    pub fn records_in_minute(&self, minute: i64) -> Vec<&Record> {
        self.by_minute
            .get(&minute)
            .map(|bucket| bucket.ids().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Drop every record in buckets strictly earlier than `minute` and move
    /// the watermark up to it. Buckets are stale until [`Self::rebuild_buckets`].
    pub fn delete_below(&mut self, minute: i64) {
        for (_, bucket) in self.by_minute.range(..minute) {
            for id in bucket.ids() {
                self.by_id.remove(id);
            }
        }
        self.watermark = self.watermark.max(minute);
    }

    /// Recompute every bucket from the remaining index.
    pub fn rebuild_buckets(&mut self) {
        let mut by_minute: BTreeMap<i64, MinuteBucket> = BTreeMap::new();
        for record in self.by_id.values() {
            by_minute.entry(record.minute()).or_default().insert(record);
        }
        self.by_minute = by_minute;
    }

    /// Count `id_num` as a confirmed gap of `minute` if it lies strictly
    /// inside that bucket's bounds.
    pub fn mark_missing(&mut self, id_num: u64, minute: i64) -> bool {
        let inside = self
            .by_minute
            .get(&minute)
            .map_or(false, |bucket| bucket.straddles(id_num));
        if inside {
            self.tally(minute, Provenance::Missing).new += 1;
        }
        inside
    }

    /// First minute whose bucket bounds strictly contain `id_num`.
    pub fn bucket_containing(&self, id_num: u64) -> Option<i64> {
        self.by_minute
            .iter()
            .find(|(_, bucket)| bucket.straddles(id_num))
            .map(|(minute, _)| *minute)
    }

    /// `new(merged)|…` for `sources`, followed by the bucket size, id spread
    /// and bounds when the minute has members.
    pub fn counts_line(&self, minute: i64, sources: &[Provenance]) -> String {
        let mut line = counts_string(self.counts.get(&minute), sources);
        if let Some(bucket) = self.by_minute.get(&minute) {
            if let (Some(min), Some(max)) = (bucket.min_id, bucket.max_id) {
                line.push_str(&format!(
                    " - {}({}) ({}-{})",
                    bucket.len(),
                    max - min,
                    base36_encode(min),
                    base36_encode(max)
                ));
            }
        }
        line
    }

    /// Whole-run tally per source.
    pub fn totals(&self) -> BTreeMap<Provenance, SourceCounts> {
        let mut totals: BTreeMap<Provenance, SourceCounts> = BTreeMap::new();
        for minute_counts in self.counts.values() {
            for (source, counts) in minute_counts {
                let total = totals.entry(*source).or_default();
                total.new += counts.new;
                total.merged += counts.merged;
            }
        }
        totals
    }

    pub fn totals_line(&self) -> String {
        counts_string(Some(&self.totals()), &Provenance::ALL)
    }
}
