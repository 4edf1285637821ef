//! Archive Merge
//!
//! Merges the ingest, rescan and download captures for a day range, backfills
//! identifier gaps and writes per-minute output files.
//!
//! Usage:
//!   archive-merge --type comments --start-date 23-04-05_00-00 --input /data --output /data/merged
//!
//! Environment:
//!   MERGE_CONFIG_PATH - TOML config file
//!   LIVE_CLIENT_ID, LIVE_CLIENT_SECRET, LIVE_USERNAME, LIVE_PASSWORD - live API credentials
//!   RUST_LOG - log filter

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use archive_merge::backfill::{
    BackfillProvider, Backfiller, FileTokenStore, HistoricalArchiveClient, LiveApiClient,
    TokenStore,
};
use archive_merge::config::{ConfigError, MergeConfig, SourceConfig};
use archive_merge::gap::GapDetector;
use archive_merge::ids::IdRange;
use archive_merge::models::{format_minute, parse_minute, Provenance, RecordKind};
use archive_merge::scheduler::{day_runs, ProcessingRun, RunSummary, WindowScheduler};
use archive_merge::transport::{
    discover_inputs, CollectingSink, FileInputs, OutputSink, ZstMinuteSink,
};
use archive_merge::MergeError;

#[derive(Parser, Debug)]
#[command(name = "archive-merge")]
#[command(about = "Combine the capture pipelines, fill gaps from remote lookups and write per-minute files")]
struct Args {
    /// The record type, either comments or submissions
    #[arg(long = "type")]
    record_type: RecordKind,

    /// Start of the range to process, YY-MM-DD_HH-MM
    #[arg(long)]
    start_date: String,

    /// Last day to process, YY-MM-DD. Defaults to the start day
    #[arg(long)]
    end_date: Option<String>,

    /// Folder holding the ingest, rescan and download roots
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output folder
    #[arg(long)]
    output: Option<PathBuf>,

    /// TOML config file
    #[arg(long, env = "MERGE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Seed the archive token store with this token
    #[arg(long)]
    archive_token: Option<String>,

    /// Ignore ids between the listed ranges, e.g. k1a-k2z,m00-m0f
    #[arg(long)]
    ignore_ids: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Merge and backfill without writing output files
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    load_env();
    let args = Args::parse();
    init_tracing(args.debug);

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            e.downcast_ref::<MergeError>()
                .map_or(1, MergeError::exit_code)
        }
    };
    std::process::exit(code);
}

fn load_env() {
    let _ = dotenv();
}

fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

fn invalid(msg: String) -> MergeError {
    MergeError::Config(ConfigError::Invalid(msg))
}

async fn run(args: Args) -> Result<()> {
    let mut config = MergeConfig::resolve(args.config.as_deref()).map_err(MergeError::from)?;
    if let Some(input) = &args.input {
        config.sources = SourceConfig::under(input);
    }
    if let Some(output) = &args.output {
        config.output_root = output.clone();
    }
    if let Some(ignore) = &args.ignore_ids {
        config.ignore_ids = Some(ignore.clone());
    }
    config.validate().map_err(MergeError::from)?;

    let kind = args.record_type;
    let start = parse_minute(&args.start_date)
        .ok_or_else(|| invalid(format!("start date '{}' is not YY-MM-DD_HH-MM", args.start_date)))?;
    let last_day = match &args.end_date {
        Some(text) => NaiveDate::parse_from_str(text, "%y-%m-%d")
            .map_err(|_| invalid(format!("end date '{}' is not YY-MM-DD", text)))?,
        None => chrono::DateTime::from_timestamp(start, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| invalid("start date out of range".to_string()))?,
    };
    let ignore = match &config.ignore_ids {
        Some(text) => IdRange::parse_list(text).map_err(invalid)?,
        None => Vec::new(),
    };

    info!("Output folder: {}", config.output_root.display());
    if !ignore.is_empty() {
        info!("Ignoring {} id range(s)", ignore.len());
    }

    let backfiller = build_backfiller(&config, args.archive_token.as_deref())?;
    let gaps = GapDetector::new(ignore).with_max_span(config.scheduler.max_gap_span);

    let runs = day_runs(kind, start, last_day, &config.scheduler);
    if runs.is_empty() {
        return Err(invalid(format!("end date {} is before the start date", last_day)).into());
    }

    for run in runs {
        let summary = if args.dry_run {
            let mut sink = CollectingSink::new();
            let summary = run_day(&config, run, &gaps, &backfiller, &mut sink).await?;
            info!(
                kind = %kind,
                minutes = sink.minutes.len(),
                records = sink.record_count(),
                "Dry run, nothing written"
            );
            summary
        } else {
            let mut sink = ZstMinuteSink::new(&config.output_root);
            run_day(&config, run, &gaps, &backfiller, &mut sink).await?
        };
        log_summary(kind, &summary);
    }

    Ok(())
}

fn build_backfiller(config: &MergeConfig, seed_token: Option<&str>) -> Result<Backfiller> {
    let mut providers: Vec<Arc<dyn BackfillProvider>> = Vec::new();

    if config.archive.enabled {
        let tokens = Arc::new(FileTokenStore::new(&config.token_path));
        if let Some(token) = seed_token {
            warn!("Saving archive token to {}", config.token_path.display());
            tokens
                .save(token)
                .map_err(|e| MergeError::Backfill(e.into()))
                .context("seeding archive token")?;
        }
        let archive = HistoricalArchiveClient::new(config.archive.clone(), tokens)
            .map_err(MergeError::from)?;
        providers.push(Arc::new(archive));
    }

    if config.live.enabled {
        match config.live.credentials.clone() {
            Some(credentials) => {
                let live = LiveApiClient::new(config.live.clone(), credentials)
                    .map_err(MergeError::from)?;
                providers.push(Arc::new(live));
            }
            None => warn!("Live API credentials not set, skipping live backfill"),
        }
    }

    Ok(Backfiller::new(
        providers,
        config.scheduler.backfill_concurrency,
    ))
}

async fn run_day(
    config: &MergeConfig,
    run: ProcessingRun,
    gaps: &GapDetector,
    backfiller: &Backfiller,
    sink: &mut dyn OutputSink,
) -> Result<RunSummary> {
    let files = discover_inputs(
        &config.sources,
        run.kind,
        run.first_minute(),
        run.final_minute(),
    )
    .map_err(MergeError::from)?;
    let mut inputs = FileInputs::new(files, config.reader.clone());
    info!(
        kind = %run.kind,
        files = inputs.file_count(),
        "Processing {} to {}",
        format_minute(run.start),
        format_minute(run.end)
    );

    let mut scheduler = WindowScheduler::new(run, gaps, backfiller);
    let summary = scheduler
        .execute(&mut inputs, sink)
        .await
        .with_context(|| format!("{} run starting {}", run.kind, format_minute(run.start)))?;
    Ok(summary)
}

fn log_summary(kind: RecordKind, summary: &RunSummary) {
    let per_source: Vec<String> = Provenance::ALL
        .iter()
        .map(|source| {
            let counts = summary.by_source.get(source).copied().unwrap_or_default();
            format!("{}={}({})", source, counts.new, counts.merged)
        })
        .collect();
    info!(
        kind = %kind,
        records = summary.records_written,
        minutes = summary.minutes_written,
        missing = summary.confirmed_missing,
        late = summary.late_drops,
        out_of_range = summary.out_of_range,
        "Run complete: {}",
        per_source.join(" ")
    );
}
