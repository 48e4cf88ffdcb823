use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use rankledger::analyzer::Period;
use rankledger::args::{AnalyzeArgs, BackfillArgs, Command, ExportArgs, PeriodArg, UpdateArgs};
use rankledger::backfill::{BackfillMode, BackfillOptions, BackfillOrchestrator, ChunkSize};
use rankledger::utils::{format_number, setup_logging, validate_args};
use rankledger::{
    export, Args, ChangeKind, ChunkState, Config, DirectoryFeed, ProgressTracker, RankChangeAnalyzer,
    ReportWriter, SqliteStore, StorePersistence, StoreStats,
};

const EXIT_FAILED_CHUNKS: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

fn run_update(config: &Config, args: &UpdateArgs) -> Result<ExitCode> {
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    let feed = DirectoryFeed::new(&config.feed_dir);
    let sqlite = SqliteStore::new(&config.store_path);
    let reports = (!args.no_reports).then(|| ReportWriter::new(&config.new_domains_dir));

    let summary = rankledger::run_daily_update(&feed, &sqlite, reports.as_ref(), date)
        .with_context(|| format!("Daily update for {} failed", date))?;

    println!("\n--- Update {} ---", summary.date);
    println!("Domains ranked: {}", format_number(summary.merge.ranked as u64));
    println!("Lines skipped: {}", format_number(summary.parse.skipped as u64));
    if summary.new_domains.suppressed {
        println!("First run: {} domains seeded, no new-domain report", format_number(summary.merge.created as u64));
    } else {
        println!("New domains: {}", format_number(summary.new_domains.domains.len() as u64));
    }
    if let Some(path) = &summary.report_path {
        println!("Report: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve_backfill_range(feed: &DirectoryFeed, args: &BackfillArgs) -> Result<(NaiveDate, NaiveDate)> {
    if let (Some(start), Some(end)) = (args.start, args.end) {
        return Ok((start, end));
    }

    let available = feed
        .scan_dates()
        .with_context(|| format!("Failed to scan feed directory {:?}", feed.root()))?;
    let (Some(first), Some(last)) = (available.first(), available.last()) else {
        anyhow::bail!("No feeds found in {:?}; pass --start and --end explicitly", feed.root());
    };
    Ok((args.start.unwrap_or(*first), args.end.unwrap_or(*last)))
}

fn run_backfill(config: &Config, args: &BackfillArgs, cancel: Arc<AtomicBool>) -> Result<ExitCode> {
    let feed = DirectoryFeed::new(&config.feed_dir);
    let sqlite = SqliteStore::new(&config.store_path);
    let (start, end) = resolve_backfill_range(&feed, args)?;

    let mut options = BackfillOptions::new(start, end);
    options.chunk_size = match (args.chunk_days, args.chunk_rows) {
        (_, Some(rows)) => ChunkSize::Rows(rows),
        (Some(days), None) => ChunkSize::Days(days),
        (None, None) => ChunkSize::default(),
    };
    options.mode = if args.retry_failed {
        BackfillMode::RetryFailed
    } else {
        BackfillMode::Normal
    };
    options.reset = args.reset_progress;
    options.stop_on_failure = args.stop_on_failure;
    options.workers = args.workers;

    let progress = ProgressTracker::load(&config.progress_path);
    let mut orchestrator = BackfillOrchestrator::new(&feed, &sqlite, progress)
        .context("Failed to load domain rank store")?
        .with_cancel_flag(cancel);
    if !args.no_reports {
        orchestrator = orchestrator.with_reports(ReportWriter::new(&config.new_domains_dir));
    }

    let summary = orchestrator.run(&options).context("Backfill aborted")?;

    println!("\n--- Backfill {} to {} ---", start, end);
    println!("Chunks planned: {}", summary.planned);
    println!("Chunks committed: {}", summary.committed.len());
    println!("Chunks saved with gaps: {}", summary.partial.len());
    println!("Chunks already done: {}", summary.skipped.len());
    println!("Dates merged: {}", format_number(summary.dates_merged as u64));
    println!("Dates without a feed: {}", summary.missing_dates.len());
    println!("New domains: {}", format_number(summary.new_domains as u64));
    for (chunk, reason) in &summary.failed {
        println!("- failed {}: {}", chunk, reason);
    }

    if summary.cancelled {
        warn!(action = "cancel", component = "main", "Backfill interrupted, rerun to resume");
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    if !summary.failed.is_empty() || !summary.partial.is_empty() {
        println!("Rerun with --retry-failed to reprocess failed and partial chunks");
        return Ok(ExitCode::from(EXIT_FAILED_CHUNKS));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_analyze(config: &Config, args: &AnalyzeArgs) -> Result<ExitCode> {
    let store = SqliteStore::new(&config.store_path)
        .load()
        .context("Failed to load domain rank store")?;

    let period = match (args.start, args.end) {
        (Some(start), Some(end)) => Period::Custom { start, end },
        _ => match args.period {
            PeriodArg::Week => Period::Week,
            PeriodArg::Month => Period::Month,
        },
    };

    let analyzer = RankChangeAnalyzer::new(&store);
    let report = analyzer.analyze(period)?;
    let written = report
        .write_csv(&config.reports_dir, args.top)
        .with_context(|| format!("Failed to write reports to {:?}", config.reports_dir))?;

    println!("\n--- Rank changes {} to {} ---", report.start, report.end);
    for kind in [ChangeKind::New, ChangeKind::Dropped, ChangeKind::Risen, ChangeKind::Fallen, ChangeKind::Unchanged] {
        println!("{}: {}", kind.as_str(), format_number(report.count(kind) as u64));
    }

    println!("\nTop {} changes:", std::cmp::min(args.top, report.meaningful().count()));
    for change in report.meaningful().take(args.top) {
        match change.delta {
            Some(delta) => println!("- {}: {:+} ({})", change.domain, delta, change.kind.as_str()),
            None => println!("- {}: {}", change.domain, change.kind.as_str()),
        }
    }
    for path in written {
        println!("Report: {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_export(config: &Config, args: &ExportArgs) -> Result<ExitCode> {
    let store = SqliteStore::new(&config.store_path)
        .load()
        .context("Failed to load domain rank store")?;
    let dir = config.export_dir(args.out_dir.as_deref());
    let written = export::export_wide(&store, &dir, args.split_size)
        .with_context(|| format!("Failed to export to {:?}", dir))?;

    for path in written {
        println!("Wrote {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_status(config: &Config) -> Result<ExitCode> {
    let store = SqliteStore::new(&config.store_path)
        .load()
        .context("Failed to load domain rank store")?;
    let stats = StoreStats::collect(&store);
    let progress = ProgressTracker::load(&config.progress_path);

    println!("\n--- Store {} ---", config.store_path.display());
    println!("Domains: {}", format_number(stats.domains as u64));
    println!("Snapshot dates: {}", format_number(stats.dates as u64));
    println!("Rank cells: {} ({} absent)", format_number(stats.cells as u64), format_number(stats.absent_cells as u64));
    match (stats.first_date, stats.last_date) {
        (Some(first), Some(last)) => println!("Date range: {} to {}", first, last),
        _ => println!("Date range: empty"),
    }

    println!("\n--- Backfill progress {} ---", progress.path().display());
    if progress.recovered_from_corruption() {
        println!("Progress file was unreadable and will be rebuilt");
    }
    for state in [ChunkState::Committed, ChunkState::Partial, ChunkState::InProgress, ChunkState::Failed, ChunkState::Pending] {
        let count = progress.chunks().filter(|(_, r)| r.state == state).count();
        println!("{:?}: {}", state, count);
    }
    let missing = progress.missing_dates();
    if !missing.is_empty() {
        println!("Dates without a feed: {}", missing.len());
    }
    for chunk in progress.list_failed() {
        let reason = progress
            .record(&chunk)
            .and_then(|r| r.last_error.as_deref())
            .unwrap_or("interrupted");
        println!("- {}: {}", chunk, reason);
    }
    Ok(ExitCode::SUCCESS)
}

fn run(args: &Args, cancel: Arc<AtomicBool>) -> Result<ExitCode> {
    let config = Config::from_args(args);
    info!(action = "start", component = "main", config = ?config, "Configuration resolved");

    match &args.command {
        Command::Update(update) => run_update(&config, update),
        Command::Backfill(backfill) => run_backfill(&config, backfill, cancel),
        Command::Analyze(analyze) => run_analyze(&config, analyze),
        Command::Export(export) => run_export(&config, export),
        Command::Status => run_status(&config),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.verbose);

    if let Err(e) = validate_args(&args) {
        error!(action = "validate", component = "main", error = %e, "Invalid arguments");
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
        }) {
            warn!(action = "signal", component = "main", error = %e, "Could not install interrupt handler");
        }
    }

    let start_time = Instant::now();
    match run(&args, cancel) {
        Ok(code) => {
            info!(action = "complete", component = "main", duration_ms = start_time.elapsed().as_millis(), "Finished");
            code
        }
        Err(e) => {
            error!(action = "fail", component = "main", error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
