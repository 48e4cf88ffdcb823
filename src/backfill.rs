//! Resumable bulk import of a historical date range.
//!
//! The range is cut into disjoint chunks. Each chunk is one transaction:
//! every available date is parsed and merged into a working copy of the
//! store, the copy is saved, and only then is the chunk recorded as
//! committed. A failure anywhere leaves the live store untouched and the
//! chunk `Failed`, ready for a `RetryFailed` run. A chunk that saved some
//! dates but lacked a source for others is `Partial` and is retried the same
//! way once the feed catches up.

use chrono::NaiveDate;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::detector::{NewDomainDetector, NewDomains, ReportWriter};
use crate::error::{RankError, Result};
use crate::feed::FeedSource;
use crate::progress::{ChunkId, ProgressTracker};
use crate::sqlite::StorePersistence;
use crate::stats::BackfillSummary;
use crate::store::TimeSeriesStore;

pub const DEFAULT_CHUNK_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// Fixed number of calendar days per chunk.
    Days(u32),
    /// Dates are added until their feed row counts reach this total.
    Rows(usize),
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Days(DEFAULT_CHUNK_DAYS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillMode {
    /// Process every chunk not yet committed.
    #[default]
    Normal,
    /// Only reprocess chunks recorded as failed.
    RetryFailed,
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub chunk_size: ChunkSize,
    pub mode: BackfillMode,
    /// Clear recorded progress before planning.
    pub reset: bool,
    /// Halt after the first failed chunk instead of moving on.
    pub stop_on_failure: bool,
    pub workers: Option<usize>,
}

impl BackfillOptions {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            chunk_size: ChunkSize::default(),
            mode: BackfillMode::default(),
            reset: false,
            stop_on_failure: false,
            workers: None,
        }
    }

    fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 8))
            .max(1)
    }
}

/// Splits `[start, end]` into disjoint chunks that cover it exactly once.
pub fn plan_chunks<F: FeedSource + ?Sized>(
    start: NaiveDate,
    end: NaiveDate,
    size: ChunkSize,
    feed: &F,
) -> Result<Vec<ChunkId>> {
    if start > end {
        return Err(RankError::InvalidRange { start, end });
    }

    let dates: Vec<NaiveDate> = ChunkId::new(start, end).dates().collect();
    let mut chunks = Vec::new();

    match size {
        ChunkSize::Days(days) => {
            for window in dates.chunks(days.max(1) as usize) {
                chunks.push(ChunkId::new(window[0], window[window.len() - 1]));
            }
        }
        ChunkSize::Rows(limit) => {
            let mut chunk_start: Option<NaiveDate> = None;
            let mut rows = 0usize;
            for date in &dates {
                let start = *chunk_start.get_or_insert(*date);
                rows += match feed.row_count(*date) {
                    Ok(count) => count,
                    Err(e) => {
                        debug!(action = "plan", component = "backfill", date = %date, error = %e, "No rows counted for date");
                        0
                    }
                };
                if rows >= limit.max(1) {
                    chunks.push(ChunkId::new(start, *date));
                    chunk_start = None;
                    rows = 0;
                }
            }
            if let Some(start) = chunk_start {
                chunks.push(ChunkId::new(start, end));
            }
        }
    }

    info!(action = "plan", component = "backfill", start = %start, end = %end, chunk_size = ?size, chunks = chunks.len(), "Backfill planned");
    Ok(chunks)
}

/// Plans `[start, end]` around the chunks `progress` already records.
///
/// Recorded chunks keep their boundaries, even one reaching past the range,
/// and only dates outside them are cut fresh with [`plan_chunks`]. A resume
/// after the feed or the chunk size changed therefore never yields chunk
/// ids that overlap recorded ones.
pub fn plan_resumable<F: FeedSource + ?Sized>(
    start: NaiveDate,
    end: NaiveDate,
    size: ChunkSize,
    feed: &F,
    progress: &ProgressTracker,
) -> Result<Vec<ChunkId>> {
    if start > end {
        return Err(RankError::InvalidRange { start, end });
    }

    let recorded: Vec<ChunkId> = progress
        .chunks()
        .map(|(id, _)| *id)
        .filter(|c| c.start <= end && c.end >= start)
        .collect();
    let mut chunks = recorded.clone();
    let mut uncovered: Option<(NaiveDate, NaiveDate)> = None;

    for date in ChunkId::new(start, end).dates() {
        if recorded.iter().any(|c| c.contains(date)) {
            if let Some((from, to)) = uncovered.take() {
                chunks.extend(plan_chunks(from, to, size, feed)?);
            }
        } else {
            uncovered = Some(match uncovered {
                Some((from, _)) => (from, date),
                None => (date, date),
            });
        }
    }
    if let Some((from, to)) = uncovered {
        chunks.extend(plan_chunks(from, to, size, feed)?);
    }

    chunks.sort_unstable();
    debug!(action = "plan", component = "backfill", recorded = recorded.len(), chunks = chunks.len(), "Plan aligned with recorded progress");
    Ok(chunks)
}

/// Everything a saved chunk produced.
#[derive(Debug)]
struct ChunkOutcome {
    store: TimeSeriesStore,
    merged_dates: Vec<NaiveDate>,
    missing_dates: Vec<NaiveDate>,
    new_domains: Vec<NewDomains>,
}

pub struct BackfillOrchestrator<'a, F: FeedSource + ?Sized, P: StorePersistence + ?Sized> {
    feed: &'a F,
    persistence: &'a P,
    progress: ProgressTracker,
    store: TimeSeriesStore,
    reports: Option<ReportWriter>,
    cancel: Arc<AtomicBool>,
}

impl<'a, F: FeedSource + ?Sized, P: StorePersistence + ?Sized> BackfillOrchestrator<'a, F, P> {
    /// Loads the store once; progress is expected to be loaded by the caller.
    pub fn new(feed: &'a F, persistence: &'a P, progress: ProgressTracker) -> Result<Self> {
        let store = persistence.load()?;
        Ok(Self {
            feed,
            persistence,
            progress,
            store,
            reports: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Write a new-domain report for every merged date.
    pub fn with_reports(mut self, writer: ReportWriter) -> Self {
        self.reports = Some(writer);
        self
    }

    /// Flag polled between chunks; once set the run stops cleanly.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &TimeSeriesStore {
        &self.store
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn into_parts(self) -> (TimeSeriesStore, ProgressTracker) {
        (self.store, self.progress)
    }

    pub fn run(&mut self, options: &BackfillOptions) -> Result<BackfillSummary> {
        let start_time = Instant::now();

        if options.reset {
            self.progress.reset();
            self.progress.flush()?;
        }

        let targets = match options.mode {
            BackfillMode::Normal => plan_resumable(
                options.start,
                options.end,
                options.chunk_size,
                self.feed,
                &self.progress,
            )?,
            BackfillMode::RetryFailed => {
                if options.start > options.end {
                    return Err(RankError::InvalidRange {
                        start: options.start,
                        end: options.end,
                    });
                }
                let failed: Vec<ChunkId> = self
                    .progress
                    .list_failed()
                    .into_iter()
                    .filter(|c| c.start >= options.start && c.end <= options.end)
                    .collect();
                info!(action = "plan", component = "backfill", chunks = failed.len(), "Retrying failed chunks");
                failed
            }
        };

        let workers = options.worker_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| RankError::Io(std::io::Error::other(e)))?;

        let mut summary = BackfillSummary {
            planned: targets.len(),
            ..BackfillSummary::default()
        };
        let mut last_report: Option<NewDomains> = None;

        for (index, chunk) in targets.iter().copied().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(action = "cancel", component = "backfill", next_chunk = %chunk, "Backfill cancelled between chunks");
                summary.cancelled = true;
                break;
            }

            if self.progress.is_committed(&chunk) {
                debug!(action = "skip", component = "backfill", chunk = %chunk, "Chunk already committed");
                summary.skipped.push(chunk);
                continue;
            }

            info!(
                action = "start",
                component = "backfill",
                chunk = %chunk,
                position = index + 1,
                total = targets.len(),
                "Processing chunk"
            );
            // Chunks not reached yet stay listed as failed
            if options.mode == BackfillMode::RetryFailed {
                self.progress.requeue(&chunk);
            }
            self.progress.mark_in_progress(chunk);
            self.progress.flush()?;

            let chunk_start = Instant::now();
            match self.process_chunk(chunk, &pool, workers) {
                Ok(outcome) => {
                    // The save succeeded, so memory follows disk from here on
                    self.store = outcome.store;
                    if outcome.missing_dates.is_empty() {
                        self.progress.mark_committed(chunk, outcome.merged_dates.clone());
                        summary.committed.push(chunk);
                    } else {
                        self.progress.mark_partial(
                            chunk,
                            outcome.merged_dates.clone(),
                            outcome.missing_dates.clone(),
                        );
                        warn!(action = "partial", component = "backfill", chunk = %chunk, dates_missing = outcome.missing_dates.len(), "Chunk saved with gaps, left for retry");
                        summary.partial.push(chunk);
                    }
                    self.progress.flush()?;

                    info!(
                        action = "commit",
                        component = "backfill",
                        chunk = %chunk,
                        dates_merged = outcome.merged_dates.len(),
                        dates_missing = outcome.missing_dates.len(),
                        domains = self.store.len(),
                        duration_ms = chunk_start.elapsed().as_millis(),
                        "Chunk saved"
                    );

                    summary.dates_merged += outcome.merged_dates.len();
                    summary.missing_dates.extend(outcome.missing_dates);
                    for report in outcome.new_domains {
                        summary.new_domains += report.domains.len();
                        self.write_report(&report, false);
                        if !report.suppressed {
                            last_report = Some(report);
                        }
                    }
                }
                Err(e) => {
                    error!(action = "fail", component = "backfill", chunk = %chunk, error = %e, "Chunk failed, store left at pre-chunk state");
                    self.progress.mark_failed(chunk, &e.to_string());
                    self.progress.flush()?;
                    summary.failed.push((chunk, e.to_string()));

                    if options.stop_on_failure {
                        warn!(action = "halt", component = "backfill", chunk = %chunk, "Stopping after failed chunk");
                        break;
                    }
                }
            }
        }

        if let Some(report) = last_report {
            self.write_report(&report, true);
        }

        info!(
            action = "complete",
            component = "backfill",
            committed = summary.committed.len(),
            partial = summary.partial.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            dates_merged = summary.dates_merged,
            cancelled = summary.cancelled,
            duration_ms = start_time.elapsed().as_millis(),
            "Backfill finished"
        );
        Ok(summary)
    }

    /// Parses and merges one chunk into a copy of the store and saves it.
    /// The live store is not touched; the caller swaps the copy in.
    fn process_chunk(
        &self,
        chunk: ChunkId,
        pool: &rayon::ThreadPool,
        workers: usize,
    ) -> Result<ChunkOutcome> {
        let dates: Vec<NaiveDate> = chunk.dates().collect();
        let feed = self.feed;
        let mut working = self.store.clone();
        let mut merged_dates = Vec::new();
        let mut missing_dates = Vec::new();
        let mut new_domains = Vec::new();

        // Parse a window of dates in parallel, merge them one by one in order
        for window in dates.chunks(workers) {
            let parsed: Vec<_> = pool.install(|| {
                window
                    .par_iter()
                    .map(|date| (*date, feed.load_snapshot(*date)))
                    .collect()
            });

            for (date, result) in parsed {
                let parsed = match result {
                    Ok(parsed) => parsed,
                    Err(e) if e.is_source_unavailable() => {
                        warn!(action = "skip", component = "backfill", chunk = %chunk, date = %date, error = %e, "Source unavailable, leaving date unprocessed");
                        missing_dates.push(date);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let first_run = NewDomainDetector::is_first_run(&working);
                let merge = working.merge(&parsed.snapshot);
                debug!(
                    action = "merge",
                    component = "backfill",
                    date = %date,
                    ranked = merge.ranked,
                    created = merge.created,
                    marked_absent = merge.marked_absent,
                    "Snapshot merged"
                );

                if self.reports.is_some() {
                    new_domains.push(NewDomainDetector::detect(&working, date, first_run));
                }
                merged_dates.push(date);
            }
        }

        if merged_dates.is_empty() {
            return Err(RankError::SourceUnavailable {
                date: chunk.start,
                path: self.feed.describe(chunk.start),
                reason: format!("no feed available for any date in {}", chunk),
            });
        }

        self.persistence.save(&working)?;

        Ok(ChunkOutcome {
            store: working,
            merged_dates,
            missing_dates,
            new_domains,
        })
    }

    fn write_report(&self, report: &NewDomains, update_latest: bool) {
        let Some(writer) = &self.reports else { return };
        if let Err(e) = writer.write(report, update_latest) {
            warn!(action = "write", component = "backfill", date = %report.date, error = %e, "Failed to write new domain report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::DirectoryFeed;
    use std::fs;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn chunk(start: &str, end: &str) -> ChunkId {
        ChunkId::new(day(start), day(end))
    }

    #[test]
    fn test_day_chunks_cover_range() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path());
        let chunks = plan_chunks(day("2024-06-08"), day("2024-06-12"), ChunkSize::Days(2), &feed).unwrap();

        assert_eq!(
            chunks,
            vec![
                chunk("2024-06-08", "2024-06-09"),
                chunk("2024-06-10", "2024-06-11"),
                chunk("2024-06-12", "2024-06-12"),
            ]
        );
    }

    #[test]
    fn test_single_day_range() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path());
        let chunks = plan_chunks(day("2024-06-08"), day("2024-06-08"), ChunkSize::Days(30), &feed).unwrap();
        assert_eq!(chunks, vec![chunk("2024-06-08", "2024-06-08")]);
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path());
        let err = plan_chunks(day("2024-06-12"), day("2024-06-08"), ChunkSize::Days(2), &feed).unwrap_err();
        assert!(matches!(err, RankError::InvalidRange { .. }));
    }

    #[test]
    fn test_resumable_plan_keeps_recorded_boundaries() {
        let tmp = TempDir::new().unwrap();
        let feed = DirectoryFeed::new(tmp.path());
        let mut progress = ProgressTracker::load(tmp.path().join("progress.json"));
        progress.mark_committed(chunk("2024-06-08", "2024-06-09"), Vec::new());
        progress.mark_failed(chunk("2024-06-12", "2024-06-16"), "disk full");

        let chunks = plan_resumable(day("2024-06-08"), day("2024-06-14"), ChunkSize::Days(3), &feed, &progress).unwrap();
        assert_eq!(
            chunks,
            vec![
                chunk("2024-06-08", "2024-06-09"),
                chunk("2024-06-10", "2024-06-11"),
                chunk("2024-06-12", "2024-06-16"),
            ]
        );

        let fresh = ProgressTracker::load(tmp.path().join("other.json"));
        let chunks = plan_resumable(day("2024-06-08"), day("2024-06-12"), ChunkSize::Days(2), &feed, &fresh).unwrap();
        assert_eq!(chunks, plan_chunks(day("2024-06-08"), day("2024-06-12"), ChunkSize::Days(2), &feed).unwrap());
    }

    #[test]
    fn test_row_chunks_follow_feed_sizes() {
        let tmp = TempDir::new().unwrap();
        for (date, rows) in [("2024-06-08", 3), ("2024-06-09", 3), ("2024-06-10", 5), ("2024-06-12", 1)] {
            let dir = tmp.path().join(date);
            fs::create_dir_all(&dir).unwrap();
            let body: String = (1..=rows).map(|r| format!("{},d{}.com\n", r, r)).collect();
            fs::write(dir.join("top-1m.csv"), body).unwrap();
        }
        let feed = DirectoryFeed::new(tmp.path());

        let chunks = plan_chunks(day("2024-06-08"), day("2024-06-13"), ChunkSize::Rows(5), &feed).unwrap();
        assert_eq!(
            chunks,
            vec![
                chunk("2024-06-08", "2024-06-09"),
                chunk("2024-06-10", "2024-06-10"),
                chunk("2024-06-11", "2024-06-13"),
            ]
        );
    }
}
