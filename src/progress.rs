//! Persisted backfill bookkeeping.
//!
//! The progress file is pretty-printed JSON so an operator can read it
//! directly when a backfill stalls. It is loaded once per run, mutated only
//! by the orchestrator and flushed atomically at every checkpoint.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{RankError, Result};
use crate::utils::write_atomic;

const PROGRESS_VERSION: u32 = 1;

/// Contiguous, inclusive date range processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChunkId {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ChunkId {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn day_count(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}

impl FromStr for ChunkId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or_else(|| format!("chunk id {:?} lacks '..'", s))?;
        let parse = |raw: &str| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|e| format!("chunk id {:?}: {}", s, e))
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start > end {
            return Err(format!("chunk id {:?} is reversed", s));
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for ChunkId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChunkId> for String {
    fn from(id: ChunkId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    #[default]
    Pending,
    InProgress,
    Committed,
    /// Saved, but some dates had no source. Retried like a failure.
    Partial,
    Failed,
}

impl ChunkState {
    pub fn needs_retry(self) -> bool {
        matches!(self, ChunkState::InProgress | ChunkState::Partial | ChunkState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ChunkRecord {
    pub state: ChunkState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub committed_dates: Vec<NaiveDate>,
    /// Dates in the chunk whose source was unavailable on the last attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dates: Vec<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ProgressFile {
    version: u32,
    chunks: BTreeMap<ChunkId, ChunkRecord>,
}

impl Default for ProgressFile {
    fn default() -> Self {
        Self {
            version: PROGRESS_VERSION,
            chunks: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    file: ProgressFile,
    recovered_from_corruption: bool,
}

impl ProgressTracker {
    /// Loads progress from `path`. A missing file is empty progress; an
    /// unreadable or invalid one is logged and also treated as empty, so
    /// work is redone rather than skipped.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::read(&path) {
            Ok(file) => {
                info!(action = "load", component = "progress_tracker", path = ?path, chunks = file.chunks.len(), "Progress loaded");
                Self {
                    path,
                    file,
                    recovered_from_corruption: false,
                }
            }
            Err(e) => {
                warn!(action = "load", component = "progress_tracker", path = ?path, error = %e, "Progress unusable, starting from scratch");
                Self {
                    path,
                    file: ProgressFile::default(),
                    recovered_from_corruption: true,
                }
            }
        }
    }

    fn read(path: &Path) -> Result<ProgressFile> {
        let corrupt = |reason: String| RankError::ProgressCorruption {
            path: path.to_path_buf(),
            reason,
        };

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ProgressFile::default()),
            Err(e) => return Err(corrupt(e.to_string())),
        };

        let file: ProgressFile = serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;
        if file.version != PROGRESS_VERSION {
            return Err(corrupt(format!("unsupported version {}", file.version)));
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the last load fell back to empty progress.
    pub fn recovered_from_corruption(&self) -> bool {
        self.recovered_from_corruption
    }

    pub fn state(&self, chunk: &ChunkId) -> ChunkState {
        self.file
            .chunks
            .get(chunk)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn record(&self, chunk: &ChunkId) -> Option<&ChunkRecord> {
        self.file.chunks.get(chunk)
    }

    pub fn chunks(&self) -> impl Iterator<Item = (&ChunkId, &ChunkRecord)> {
        self.file.chunks.iter()
    }

    pub fn is_committed(&self, chunk: &ChunkId) -> bool {
        self.state(chunk) == ChunkState::Committed
    }

    pub fn mark_in_progress(&mut self, chunk: ChunkId) {
        let record = self.entry(chunk);
        record.state = ChunkState::InProgress;
        record.attempts += 1;
    }

    pub fn mark_committed(&mut self, chunk: ChunkId, committed_dates: Vec<NaiveDate>) {
        let record = self.entry(chunk);
        record.state = ChunkState::Committed;
        record.committed_dates = committed_dates;
        record.missing_dates.clear();
        record.last_error = None;
    }

    /// The merged dates are durable but the chunk still has gaps, so it
    /// stays eligible for retry.
    pub fn mark_partial(
        &mut self,
        chunk: ChunkId,
        merged_dates: Vec<NaiveDate>,
        missing_dates: Vec<NaiveDate>,
    ) {
        let record = self.entry(chunk);
        record.state = ChunkState::Partial;
        record.last_error = Some(format!("{} date(s) without a source", missing_dates.len()));
        record.committed_dates = merged_dates;
        record.missing_dates = missing_dates;
    }

    pub fn mark_failed(&mut self, chunk: ChunkId, error: &str) {
        let record = self.entry(chunk);
        record.state = ChunkState::Failed;
        record.last_error = Some(error.to_string());
    }

    /// Chunks attempted but never fully committed. A chunk left `InProgress`
    /// by a killed run counts as failed, and so does a `Partial` one.
    pub fn list_failed(&self) -> Vec<ChunkId> {
        self.file
            .chunks
            .iter()
            .filter(|(_, r)| r.state.needs_retry())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Explicit retry: moves a failed chunk back to `Pending`.
    pub fn requeue(&mut self, chunk: &ChunkId) -> bool {
        match self.file.chunks.get_mut(chunk) {
            Some(record) if record.state.needs_retry() => {
                record.state = ChunkState::Pending;
                record.updated_at = Utc::now().to_rfc3339();
                true
            }
            _ => false,
        }
    }

    /// Dates merged into the saved store, from committed and partial chunks.
    pub fn committed_dates(&self) -> BTreeSet<NaiveDate> {
        self.file
            .chunks
            .values()
            .filter(|r| matches!(r.state, ChunkState::Committed | ChunkState::Partial))
            .flat_map(|r| r.committed_dates.iter().copied())
            .collect()
    }

    /// Open gaps: dates of partial chunks that still have no source.
    pub fn missing_dates(&self) -> BTreeSet<NaiveDate> {
        self.file
            .chunks
            .values()
            .filter(|r| r.state == ChunkState::Partial)
            .flat_map(|r| r.missing_dates.iter().copied())
            .collect()
    }

    /// Forgets all recorded progress. Takes effect on disk at the next flush.
    pub fn reset(&mut self) {
        warn!(action = "reset", component = "progress_tracker", path = ?self.path, chunks = self.file.chunks.len(), "Clearing backfill progress");
        self.file = ProgressFile::default();
    }

    pub fn flush(&self) -> Result<()> {
        write_atomic(&self.path, |w| {
            serde_json::to_writer_pretty(&mut *w, &self.file)?;
            w.write_all(b"\n")
        })?;
        Ok(())
    }

    fn entry(&mut self, chunk: ChunkId) -> &mut ChunkRecord {
        let record = self.file.chunks.entry(chunk).or_default();
        record.updated_at = Utc::now().to_rfc3339();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn chunk(start: &str, end: &str) -> ChunkId {
        ChunkId::new(day(start), day(end))
    }

    #[test]
    fn test_chunk_id_text_form() {
        let id = chunk("2024-06-08", "2024-06-09");
        assert_eq!(id.to_string(), "2024-06-08..2024-06-09");
        assert_eq!("2024-06-08..2024-06-09".parse::<ChunkId>().unwrap(), id);
        assert!("2024-06-09..2024-06-08".parse::<ChunkId>().is_err());
        assert!("garbage".parse::<ChunkId>().is_err());
        assert_eq!(id.dates().collect::<Vec<_>>(), vec![day("2024-06-08"), day("2024-06-09")]);
        assert_eq!(id.day_count(), 2);
    }

    #[test]
    fn test_state_transitions_survive_flush() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        let first = chunk("2024-06-08", "2024-06-09");
        let second = chunk("2024-06-10", "2024-06-11");

        let mut tracker = ProgressTracker::load(&path);
        tracker.mark_in_progress(first);
        tracker.mark_committed(first, first.dates().collect());
        tracker.mark_in_progress(second);
        tracker.mark_failed(second, "disk full");
        tracker.flush().unwrap();

        let reloaded = ProgressTracker::load(&path);
        assert!(!reloaded.recovered_from_corruption());
        assert!(reloaded.is_committed(&first));
        assert_eq!(reloaded.state(&second), ChunkState::Failed);
        assert_eq!(reloaded.list_failed(), vec![second]);
        assert_eq!(reloaded.record(&second).unwrap().last_error.as_deref(), Some("disk full"));
        assert_eq!(reloaded.record(&second).unwrap().attempts, 1);
        assert_eq!(reloaded.committed_dates().len(), 2);
        assert_eq!(reloaded.state(&chunk("2024-06-12", "2024-06-12")), ChunkState::Pending);
    }

    #[test]
    fn test_in_progress_counts_as_failed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        let id = chunk("2024-06-08", "2024-06-09");

        let mut tracker = ProgressTracker::load(&path);
        tracker.mark_in_progress(id);
        tracker.flush().unwrap();

        let mut reloaded = ProgressTracker::load(&path);
        assert_eq!(reloaded.list_failed(), vec![id]);
        assert!(reloaded.requeue(&id));
        assert_eq!(reloaded.state(&id), ChunkState::Pending);
        assert!(reloaded.list_failed().is_empty());
        assert!(!reloaded.requeue(&id));
    }

    #[test]
    fn test_corrupt_file_means_no_progress() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        fs::write(&path, "{ not json").unwrap();

        let tracker = ProgressTracker::load(&path);
        assert!(tracker.recovered_from_corruption());
        assert_eq!(tracker.chunks().count(), 0);

        fs::write(&path, r#"{"version": 99, "chunks": {}}"#).unwrap();
        assert!(ProgressTracker::load(&path).recovered_from_corruption());
    }

    #[test]
    fn test_reset_clears_on_flush() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        let id = chunk("2024-06-08", "2024-06-09");

        let mut tracker = ProgressTracker::load(&path);
        tracker.mark_committed(id, id.dates().collect());
        tracker.flush().unwrap();
        tracker.reset();
        tracker.flush().unwrap();

        assert!(!ProgressTracker::load(&path).is_committed(&id));
    }

    #[test]
    fn test_progress_file_is_readable_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        let id = chunk("2024-06-10", "2024-06-11");

        let mut tracker = ProgressTracker::load(&path);
        tracker.mark_partial(id, vec![day("2024-06-10")], vec![day("2024-06-11")]);
        tracker.flush().unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value["chunks"]["2024-06-10..2024-06-11"];
        assert_eq!(entry["state"], "partial");
        assert_eq!(entry["missing_dates"][0], "2024-06-11");
    }

    #[test]
    fn test_partial_chunk_is_retried_until_complete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("progress.json");
        let id = chunk("2024-06-10", "2024-06-11");

        let mut tracker = ProgressTracker::load(&path);
        tracker.mark_in_progress(id);
        tracker.mark_partial(id, vec![day("2024-06-10")], vec![day("2024-06-11")]);
        tracker.flush().unwrap();

        let mut tracker = ProgressTracker::load(&path);
        assert!(!tracker.is_committed(&id));
        assert_eq!(tracker.list_failed(), vec![id]);
        assert_eq!(tracker.missing_dates().into_iter().collect::<Vec<_>>(), vec![day("2024-06-11")]);
        assert_eq!(tracker.committed_dates().len(), 1);

        tracker.mark_in_progress(id);
        tracker.mark_committed(id, id.dates().collect());
        assert!(tracker.is_committed(&id));
        assert!(tracker.list_failed().is_empty());
        assert!(tracker.missing_dates().is_empty());
        assert!(tracker.record(&id).unwrap().last_error.is_none());
    }
}
