use chrono::NaiveDate;
use std::path::PathBuf;

use crate::detector::NewDomains;
use crate::progress::ChunkId;
use crate::snapshot::ParseReport;
use crate::store::{MergeOutcome, TimeSeriesStore};

#[derive(Debug, Clone)]
pub struct UpdateSummary {
    pub date: NaiveDate,
    pub parse: ParseReport,
    pub merge: MergeOutcome,
    pub new_domains: NewDomains,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub planned: usize,
    pub committed: Vec<ChunkId>,
    /// Saved, but some dates had no source yet.
    pub partial: Vec<ChunkId>,
    pub skipped: Vec<ChunkId>,
    pub failed: Vec<(ChunkId, String)>,
    pub dates_merged: usize,
    pub missing_dates: Vec<NaiveDate>,
    pub new_domains: usize,
    /// Stopped between chunks by a cancellation request.
    pub cancelled: bool,
}

impl BackfillSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.partial.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub domains: usize,
    pub dates: usize,
    pub cells: usize,
    pub absent_cells: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

impl StoreStats {
    pub fn collect(store: &TimeSeriesStore) -> Self {
        let absent_cells = store
            .domains()
            .flat_map(|(_, h)| h.ranks().values())
            .filter(|cell| cell.is_absent())
            .count();

        Self {
            domains: store.len(),
            dates: store.dates().len(),
            cells: store.cell_count(),
            absent_cells,
            first_date: store.dates().iter().next().copied(),
            last_date: store.latest_date(),
        }
    }
}
