//! Dense-identifier gap detection for a finalized minute span.

use tracing::{debug, warn};

use crate::ids::{base36_encode, IdRange};
use crate::models::format_minute;
use crate::store::{GapScan, RecordStore};

/// Widest id span enumerated by default.
pub const DEFAULT_MAX_SPAN: u64 = 1_000_000;

/// Finds the identifiers a span should contain but does not.
#[derive(Debug, Clone)]
pub struct GapDetector {
    ignore: Vec<IdRange>,
    max_span: u64,
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl GapDetector {
    pub fn new(ignore: Vec<IdRange>) -> Self {
        Self {
            ignore,
            max_span: DEFAULT_MAX_SPAN,
        }
    }

    /// Skip backfill for spans whose id bounds are more than `max_span` apart.
    pub fn with_max_span(mut self, max_span: u64) -> Self {
        self.max_span = max_span.max(1);
        self
    }

    pub fn ignore_ranges(&self) -> &[IdRange] {
        &self.ignore
    }

    /// Missing identifiers for `[start_minute, end_minute]`, or `None` when
    /// the span has no usable id bounds.
    pub fn scan(&self, store: &RecordStore, start_minute: i64, end_minute: i64) -> Option<GapScan> {
        if let Some((low, high)) = store.id_bounds(start_minute, end_minute) {
            let span = high.saturating_sub(low);
            if span > self.max_span {
                warn!(
                    kind = %store.kind(),
                    "Id span {}-{} ({} ids) for {} to {} exceeds {}, skipping backfill",
                    base36_encode(low),
                    base36_encode(high),
                    span,
                    format_minute(start_minute),
                    format_minute(end_minute),
                    self.max_span
                );
                return None;
            }
        }

        let Some(scan) = store.missing_ids_in_range(start_minute, end_minute, &self.ignore) else {
            warn!(
                kind = %store.kind(),
                "Unable to get start or end id for span {} to {}",
                format_minute(start_minute),
                format_minute(end_minute)
            );
            return None;
        };

        if scan.ignored > 0 {
            warn!(
                kind = %store.kind(),
                "Ignored {} ids in range {}-{}",
                scan.ignored,
                base36_encode(scan.low),
                base36_encode(scan.high)
            );
        }
        debug!(
            kind = %store.kind(),
            "Backfilling from {} ({}|{}) to {} ({}|{}) with {} ({}) ids",
            format_minute(start_minute),
            base36_encode(scan.low),
            scan.low,
            format_minute(end_minute),
            base36_encode(scan.high),
            scan.high,
            scan.missing.len(),
            scan.high.saturating_sub(scan.low)
        );
        Some(scan)
    }
}

/// Split `ids` into provider-sized batches. A zero size is treated as one.
pub fn batches(ids: &[String], size: usize) -> impl Iterator<Item = &[String]> {
    ids.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::base36_decode;
    use crate::models::{Provenance, Record, RecordKind};
    use serde_json::json;

    const START: i64 = 1_700_000_040;

    fn store_with(ids: &[u64]) -> RecordStore {
        let mut store = RecordStore::new(RecordKind::Submission, START, START + 600);
        for (i, id) in ids.iter().enumerate() {
            let value = json!({"id": base36_encode(*id), "created_utc": START + i as i64});
            store.add(Record::from_value(value, Provenance::Ingest).unwrap());
        }
        store
    }

    #[test]
    fn test_scan_applies_ignore_ranges() {
        let base = base36_decode("zz0").unwrap();
        let store = store_with(&[base, base + 6]);
        let detector = GapDetector::new(vec![IdRange { start: base + 1, end: base + 2 }]);
        let scan = detector.scan(&store, START, START).unwrap();
        let expected: Vec<String> = (base + 3..=base + 5).map(base36_encode).collect();
        assert_eq!(scan.missing, expected);
        assert_eq!(scan.ignored, 2);
    }

    #[test]
    fn test_scan_without_bounds() {
        let store = store_with(&[]);
        assert!(GapDetector::default().scan(&store, START, START + 60).is_none());
    }

    #[test]
    fn test_scan_skips_oversized_span() {
        let base = base36_decode("k000").unwrap();
        let store = store_with(&[base, base + 50]);
        let narrow = GapDetector::default().with_max_span(10);
        assert!(narrow.scan(&store, START, START).is_none());

        let wide = GapDetector::default().with_max_span(50);
        assert_eq!(wide.scan(&store, START, START).unwrap().missing.len(), 49);
    }

    #[test]
    fn test_batches_respect_limit() {
        let ids: Vec<String> = (0..120u64).map(base36_encode).collect();
        let sizes: Vec<usize> = batches(&ids, 50).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(batches(&ids, 0).count(), 120);
        assert_eq!(batches(&[], 100).count(), 0);
    }
}
