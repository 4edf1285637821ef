//! Watermark-driven windowing over one processing run.
//!
//! Minutes are read in order from `start - padding` to `end + padding`.
//! Records created in a minute can show up in later minutes' files, so a
//! span is only finalized once enough minutes are buffered behind it (or the
//! input is exhausted). Finalizing a span means: detect gaps, backfill them,
//! write every minute of the span in order, then drop it from memory.
//!
//! ```text
//!   Idle -> Streaming -> Lookahead -> Finalizing -> Flushing -> Streaming ... -> Done
//!                 \                        \
//!                  `-> Aborted              `-> Aborted
//! ```

use chrono::{Duration as ChronoDuration, NaiveDate};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::backfill::Backfiller;
use crate::config::SchedulerConfig;
use crate::error::MergeError;
use crate::gap::GapDetector;
use crate::merge::MergeReport;
use crate::models::{format_day, format_minute, minute_of, Provenance, RecordKind, MINUTE_SECS};
use crate::store::{RecordStore, SourceCounts};
use crate::transport::{MinuteInputs, OutputSink};

// =============================================================================
// RUN
// =============================================================================

/// The range `[start, end)` of one run plus its read padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingRun {
    pub kind: RecordKind,
    pub start: i64,
    pub end: i64,
    pub padding_minutes: i64,
    pub lookahead_minutes: usize,
}

impl ProcessingRun {
    pub fn new(kind: RecordKind, start: i64, end: i64, config: &SchedulerConfig) -> Self {
        Self {
            kind,
            start,
            end,
            padding_minutes: config.padding_minutes,
            lookahead_minutes: config.lookahead_minutes.max(1),
        }
    }

    /// First minute read.
    pub fn first_minute(&self) -> i64 {
        minute_of(self.start) - self.padding_minutes * MINUTE_SECS
    }

    /// Final padded minute. Reaching it finalizes everything left.
    pub fn final_minute(&self) -> i64 {
        minute_of(self.end) + self.padding_minutes * MINUTE_SECS
    }

    /// Last minute whose records belong to the run.
    pub fn last_run_minute(&self) -> i64 {
        minute_of(self.end - 1)
    }

    /// Highest minute that may be finalized while `current` is being read.
    pub fn span_end(&self, current: i64) -> i64 {
        if current > self.last_run_minute() {
            self.last_run_minute()
        } else {
            current - MINUTE_SECS
        }
    }
}

/// Split `[start, last_day]` into runs ending at each following midnight.
pub fn day_runs(
    kind: RecordKind,
    start: i64,
    last_day: NaiveDate,
    config: &SchedulerConfig,
) -> Vec<ProcessingRun> {
    let mut runs = Vec::new();
    let mut run_start = start;
    loop {
        let Some(day) = chrono::DateTime::from_timestamp(run_start, 0).map(|dt| dt.date_naive())
        else {
            break;
        };
        if day > last_day {
            break;
        }
        let next_midnight = (day + ChronoDuration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp());
        let Some(next_midnight) = next_midnight else {
            break;
        };
        runs.push(ProcessingRun::new(kind, run_start, next_midnight, config));
        run_start = next_midnight;
    }
    runs
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Streaming,
    Lookahead,
    Finalizing,
    Flushing,
    Done,
    Aborted,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Lookahead => write!(f, "LOOKAHEAD"),
            Self::Finalizing => write!(f, "FINALIZING"),
            Self::Flushing => write!(f, "FLUSHING"),
            Self::Done => write!(f, "DONE"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Totals for a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub records_written: usize,
    pub minutes_written: usize,
    pub by_source: BTreeMap<Provenance, SourceCounts>,
    pub confirmed_missing: u64,
    pub late_drops: u64,
    pub out_of_range: u64,
}

/// Sequencer for one run. Owns the run's [`RecordStore`].
pub struct WindowScheduler<'a> {
    run: ProcessingRun,
    store: RecordStore,
    gaps: &'a GapDetector,
    backfiller: &'a Backfiller,
    phase: SchedulerPhase,
    records_written: usize,
    minutes_written: usize,
}

impl<'a> WindowScheduler<'a> {
    pub fn new(run: ProcessingRun, gaps: &'a GapDetector, backfiller: &'a Backfiller) -> Self {
        Self {
            store: RecordStore::new(run.kind, run.start, run.end),
            run,
            gaps,
            backfiller,
            phase: SchedulerPhase::Idle,
            records_written: 0,
            minutes_written: 0,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn transition(&mut self, next: SchedulerPhase) {
        if self.phase != next {
            debug!(kind = %self.run.kind, from = %self.phase, to = %next, "Scheduler transition");
            self.phase = next;
        }
    }

    /// Read every minute of the run, finalizing spans as the watermark allows.
    pub async fn execute(
        &mut self,
        inputs: &mut dyn MinuteInputs,
        sink: &mut dyn OutputSink,
    ) -> Result<RunSummary, MergeError> {
        match self.stream(inputs, sink).await {
            Ok(()) => {
                self.transition(SchedulerPhase::Done);
                let summary = self.summary();
                info!(
                    kind = %self.run.kind,
                    "Finished day {}: {}",
                    format_day(self.run.start),
                    self.store.totals_line()
                );
                Ok(summary)
            }
            Err(e) => {
                self.transition(SchedulerPhase::Aborted);
                error!(kind = %self.run.kind, "Run aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn stream(
        &mut self,
        inputs: &mut dyn MinuteInputs,
        sink: &mut dyn OutputSink,
    ) -> Result<(), MergeError> {
        let kind = self.run.kind;
        let final_minute = self.run.final_minute();
        let mut minute = self.run.first_minute();

        while minute <= final_minute {
            self.transition(SchedulerPhase::Streaming);
            let mut report = MergeReport::default();
            for record in inputs.load_minute(minute)? {
                report.absorb(self.store.add(record));
            }
            info!(
                kind = %kind,
                "Loaded {} : {}",
                format_minute(minute),
                self.store.counts_line(minute, &Provenance::LOCAL)
            );
            self.check_unmatched(minute, report)?;

            self.transition(SchedulerPhase::Lookahead);
            if minute >= final_minute || self.store.count_minutes() >= self.run.lookahead_minutes {
                let low = self.store.watermark();
                let high = self.run.span_end(minute);
                if low <= high {
                    self.finalize(low, high, sink).await?;
                }
            }

            minute += MINUTE_SECS;
        }
        Ok(())
    }

    /// Backfill then flush `[low, high]`.
    async fn finalize(
        &mut self,
        low: i64,
        high: i64,
        sink: &mut dyn OutputSink,
    ) -> Result<(), MergeError> {
        let kind = self.run.kind;
        self.transition(SchedulerPhase::Finalizing);

        if let Some(scan) = self.gaps.scan(&self.store, low, high) {
            let outcome = self.backfiller.fill(&mut self.store, &scan).await?;
            self.check_unmatched(high, outcome.report)?;
        }

        self.transition(SchedulerPhase::Flushing);
        let mut minute = low;
        while minute <= high {
            let records = self.store.records_in_minute(minute);
            sink.write_minute(kind, minute, &records)?;
            self.records_written += records.len();
            self.minutes_written += 1;
            info!(
                kind = %kind,
                "Wrote up to {} : {}",
                format_minute(minute),
                self.store.counts_line(minute, &Provenance::REMOTE)
            );
            minute += MINUTE_SECS;
        }

        self.store.delete_below(high + MINUTE_SECS);
        self.store.rebuild_buckets();
        Ok(())
    }

    fn check_unmatched(&self, minute: i64, report: MergeReport) -> Result<(), MergeError> {
        if !report.is_unmatched() {
            return Ok(());
        }
        for field in &report.unmatched {
            warn!(kind = %self.run.kind, "Unmatched field: {}", field);
        }
        warn!(kind = %self.run.kind, "Unmatched field, aborting");
        Err(MergeError::SchemaDrift {
            kind: self.run.kind,
            minute,
            fields: report.unmatched,
        })
    }

    fn summary(&self) -> RunSummary {
        let by_source = self.store.totals();
        RunSummary {
            records_written: self.records_written,
            minutes_written: self.minutes_written,
            confirmed_missing: by_source
                .get(&Provenance::Missing)
                .map_or(0, |counts| counts.new),
            by_source,
            late_drops: self.store.late_drops(),
            out_of_range: self.store.out_of_range(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{base36_decode, base36_encode};
    use crate::models::{parse_minute, Record};
    use crate::transport::{CollectingSink, MemoryInputs};
    use serde_json::json;

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn record(id: &str, created: i64) -> Record {
        Record::from_value(json!({"id": id, "created_utc": created}), Provenance::Ingest).unwrap()
    }

    fn no_providers() -> Backfiller {
        Backfiller::new(Vec::new(), 1)
    }

    #[test]
    fn test_run_minutes() {
        let start = parse_minute("23-04-05_00-00").unwrap();
        let run = ProcessingRun::new(RecordKind::Comment, start, start + 86_400, &config());
        assert_eq!(run.first_minute(), start - 120);
        assert_eq!(run.final_minute(), start + 86_400 + 120);
        assert_eq!(run.last_run_minute(), start + 86_400 - 60);
        assert_eq!(run.span_end(start + 600), start + 540);
        assert_eq!(run.span_end(start + 86_400 + 60), start + 86_400 - 60);
    }

    #[test]
    fn test_day_runs() {
        let start = parse_minute("23-04-05_12-30").unwrap();
        let last = NaiveDate::from_ymd_opt(2023, 4, 7).unwrap();
        let runs = day_runs(RecordKind::Submission, start, last, &config());
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].start, start);
        assert_eq!(runs[0].end, parse_minute("23-04-06_00-00").unwrap());
        assert_eq!(runs[2].end, parse_minute("23-04-08_00-00").unwrap());

        let same_day = NaiveDate::from_ymd_opt(2023, 4, 5).unwrap();
        assert_eq!(day_runs(RecordKind::Comment, start, same_day, &config()).len(), 1);
    }

    #[tokio::test]
    async fn test_flush_order_and_lookahead() {
        let start = parse_minute("23-04-05_10-00").unwrap();
        let run = ProcessingRun::new(RecordKind::Comment, start, start + 30 * 60, &config());
        let gaps = GapDetector::default();
        let backfiller = no_providers();
        let base = base36_decode("k000").unwrap();

        // Two records per minute, the later-created one arriving first and
        // each minute's second record arriving a minute late.
        let mut inputs = MemoryInputs::new();
        for m in 0..30i64 {
            let minute = start + m * 60;
            let first = base + (m as u64) * 2;
            inputs.push(minute, record(&base36_encode(first + 1), minute + 40));
            inputs.push(minute + 60, record(&base36_encode(first), minute + 10));
        }

        let mut sink = CollectingSink::new();
        let mut scheduler = WindowScheduler::new(run, &gaps, &backfiller);
        let summary = scheduler.execute(&mut inputs, &mut sink).await.unwrap();

        assert_eq!(scheduler.phase(), SchedulerPhase::Done);
        assert_eq!(summary.minutes_written, 30);
        assert_eq!(summary.records_written, 60);
        assert_eq!(summary.late_drops, 0);

        let minutes: Vec<i64> = sink.minutes.iter().map(|(m, _)| *m).collect();
        let expected: Vec<i64> = (0..30).map(|m| start + m * 60).collect();
        assert_eq!(minutes, expected);
        for (minute, records) in &sink.minutes {
            assert_eq!(records.len(), 2);
            assert!(records.iter().all(|r| r.minute() == *minute));
            assert!(records[0].sort_key() < records[1].sort_key());
        }
        assert!(scheduler.store().is_empty());
    }

    #[tokio::test]
    async fn test_empty_run_still_writes_every_minute() {
        let start = parse_minute("23-04-05_10-00").unwrap();
        let run = ProcessingRun::new(RecordKind::Submission, start, start + 5 * 60, &config());
        let gaps = GapDetector::default();
        let backfiller = no_providers();
        let mut sink = CollectingSink::new();

        let summary = WindowScheduler::new(run, &gaps, &backfiller)
            .execute(&mut MemoryInputs::new(), &mut sink)
            .await
            .unwrap();
        assert_eq!(summary.minutes_written, 5);
        assert_eq!(sink.record_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_field_aborts_after_minute() {
        let start = parse_minute("23-04-05_10-00").unwrap();
        let run = ProcessingRun::new(RecordKind::Comment, start, start + 30 * 60, &config());
        let gaps = GapDetector::default();
        let backfiller = no_providers();

        let mut inputs = MemoryInputs::new();
        inputs.push(start, record("a1", start + 1));
        let odd = Record::from_value(
            json!({"id": "a2", "created_utc": start + 2, "brand_new_field": true}),
            Provenance::Rescan,
        )
        .unwrap();
        inputs.push(start + 60, odd);

        let mut sink = CollectingSink::new();
        let mut scheduler = WindowScheduler::new(run, &gaps, &backfiller);
        let err = scheduler.execute(&mut inputs, &mut sink).await.unwrap_err();

        assert_eq!(scheduler.phase(), SchedulerPhase::Aborted);
        assert_eq!(err.exit_code(), 1);
        match err {
            MergeError::SchemaDrift { minute, fields, .. } => {
                assert_eq!(minute, start + 60);
                assert_eq!(fields[0].field, "brand_new_field");
                assert_eq!(fields[0].id, "a2");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(sink.minutes.is_empty());
    }
}
