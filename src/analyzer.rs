use chrono::{Duration, NaiveDate, Utc};
use std::cmp::Reverse;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{RankError, Result};
use crate::sqlite::format_date;
use crate::store::TimeSeriesStore;
use crate::utils::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Latest snapshot against the one 7 days earlier.
    Week,
    /// Latest snapshot against the one 30 days earlier.
    Month,
    Custom { start: NaiveDate, end: NaiveDate },
}

impl Period {
    pub fn label(&self) -> String {
        match self {
            Period::Week => "week".to_string(),
            Period::Month => "month".to_string(),
            Period::Custom { start, end } => format!("{}_{}", format_date(*start), format_date(*end)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    New,
    Dropped,
    Risen,
    Fallen,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Dropped => "dropped",
            ChangeKind::Risen => "risen",
            ChangeKind::Fallen => "fallen",
            ChangeKind::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankChange {
    pub domain: String,
    pub start_rank: Option<u32>,
    pub end_rank: Option<u32>,
    /// `end - start`; negative means the domain climbed.
    pub delta: Option<i64>,
    pub kind: ChangeKind,
}

impl RankChange {
    fn classify(domain: &str, start_rank: Option<u32>, end_rank: Option<u32>) -> Option<Self> {
        let (delta, kind) = match (start_rank, end_rank) {
            (None, None) => return None,
            (None, Some(_)) => (None, ChangeKind::New),
            (Some(_), None) => (None, ChangeKind::Dropped),
            (Some(start), Some(end)) => {
                let delta = i64::from(end) - i64::from(start);
                let kind = match delta {
                    d if d < 0 => ChangeKind::Risen,
                    d if d > 0 => ChangeKind::Fallen,
                    _ => ChangeKind::Unchanged,
                };
                (Some(delta), kind)
            }
        };

        Some(Self {
            domain: domain.to_string(),
            start_rank,
            end_rank,
            delta,
            kind,
        })
    }

    /// Relative move against the starting rank, positive when climbing.
    pub fn percent(&self) -> Option<f64> {
        match (self.start_rank, self.delta) {
            (Some(start), Some(delta)) => Some(-(delta as f64) * 100.0 / f64::from(start)),
            _ => None,
        }
    }

    /// Entries and exits outrank any finite move.
    fn sort_key(&self) -> (u8, Reverse<u64>) {
        match self.delta {
            None => (0, Reverse(u64::MAX)),
            Some(delta) => (1, Reverse(delta.unsigned_abs())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeReport {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Ordered by magnitude of change, largest first.
    pub changes: Vec<RankChange>,
}

impl ChangeReport {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &RankChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    pub fn meaningful(&self) -> impl Iterator<Item = &RankChange> {
        self.changes.iter().filter(|c| c.kind != ChangeKind::Unchanged)
    }

    /// Writes `rank_changes_<label>.csv`, `rising_<label>.csv` and
    /// `falling_<label>.csv`, each capped at `top` rows.
    pub fn write_csv(&self, dir: &Path, top: usize) -> Result<Vec<PathBuf>> {
        let outputs = [
            (format!("rank_changes_{}.csv", self.label), self.meaningful().take(top).collect::<Vec<_>>()),
            (format!("rising_{}.csv", self.label), self.of_kind(ChangeKind::Risen).take(top).collect()),
            (format!("falling_{}.csv", self.label), self.of_kind(ChangeKind::Fallen).take(top).collect()),
        ];

        let mut written = Vec::new();
        for (name, rows) in outputs {
            let path = dir.join(name);
            write_atomic(&path, |w| {
                writeln!(w, "domain,start_rank,end_rank,rank_change,change_percent,classification")?;
                for change in rows {
                    let percent = match change.kind {
                        ChangeKind::New | ChangeKind::Dropped => change.kind.as_str().to_string(),
                        _ => change.percent().map(|p| format!("{:.2}%", p)).unwrap_or_default(),
                    };
                    writeln!(
                        w,
                        "{},{},{},{},{},{}",
                        change.domain,
                        change.start_rank.unwrap_or(0),
                        change.end_rank.unwrap_or(0),
                        change.delta.map(|d| d.to_string()).unwrap_or_default(),
                        percent,
                        change.kind.as_str()
                    )?;
                }
                Ok(())
            })?;
            info!(action = "write", component = "rank_change_report", path = ?path, "Rank change report written");
            written.push(path);
        }
        Ok(written)
    }
}

pub struct RankChangeAnalyzer<'a> {
    store: &'a TimeSeriesStore,
}

impl<'a> RankChangeAnalyzer<'a> {
    pub fn new(store: &'a TimeSeriesStore) -> Self {
        Self { store }
    }

    /// Turns a period into two snapshot dates, snapping each requested
    /// date back to the closest snapshot on or before it.
    pub fn resolve(&self, period: Period) -> Result<(NaiveDate, NaiveDate)> {
        let anchor = self
            .store
            .latest_date()
            .unwrap_or_else(|| Utc::now().date_naive());

        let (start, end) = match period {
            Period::Week => (anchor - Duration::days(7), anchor),
            Period::Month => (anchor - Duration::days(30), anchor),
            Period::Custom { start, end } if start > end => {
                warn!(action = "resolve", component = "rank_change_analyzer", start = %start, end = %end, "Start after end, swapping");
                (end, start)
            }
            Period::Custom { start, end } => (start, end),
        };

        Ok((self.snap(start)?, self.snap(end)?))
    }

    fn snap(&self, date: NaiveDate) -> Result<NaiveDate> {
        let snapped = self
            .store
            .nearest_date_on_or_before(date)
            .ok_or(RankError::NoSnapshotOnOrBefore(date))?;
        if snapped != date {
            info!(action = "resolve", component = "rank_change_analyzer", requested = %date, using = %snapped, "Using closest earlier snapshot");
        }
        Ok(snapped)
    }

    pub fn analyze(&self, period: Period) -> Result<ChangeReport> {
        let (start, end) = self.resolve(period)?;
        Ok(self.compare(period.label(), start, end))
    }

    /// Compares two snapshot dates for every domain ranked on either.
    pub fn compare(&self, label: String, start: NaiveDate, end: NaiveDate) -> ChangeReport {
        let mut changes: Vec<RankChange> = self
            .store
            .domains()
            .filter_map(|(name, _)| {
                let start_rank = self.store.rank_on(name, start).and_then(|c| c.rank());
                let end_rank = self.store.rank_on(name, end).and_then(|c| c.rank());
                RankChange::classify(name, start_rank, end_rank)
            })
            .collect();
        changes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()).then_with(|| a.domain.cmp(&b.domain)));

        let report = ChangeReport {
            label,
            start,
            end,
            changes,
        };
        info!(
            action = "compare",
            component = "rank_change_analyzer",
            start = %start,
            end = %end,
            new = report.count(ChangeKind::New),
            dropped = report.count(ChangeKind::Dropped),
            risen = report.count(ChangeKind::Risen),
            fallen = report.count(ChangeKind::Fallen),
            "Rank changes computed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RankSnapshot;
    use std::fs;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn two_day_store() -> TimeSeriesStore {
        let mut store = TimeSeriesStore::new();
        store.merge(&RankSnapshot::from_pairs(
            day("2024-06-01"),
            [(1, "steady.com"), (2, "dropper.com"), (10, "climber.com"), (3, "slider.com")],
        ));
        store.merge(&RankSnapshot::from_pairs(
            day("2024-06-08"),
            [(1, "steady.com"), (4, "climber.com"), (5, "slider.com"), (2, "fresh.com")],
        ));
        store
    }

    #[test]
    fn test_classification() {
        let store = two_day_store();
        let report = RankChangeAnalyzer::new(&store).compare("t".into(), day("2024-06-01"), day("2024-06-08"));

        let kind_of = |d: &str| report.changes.iter().find(|c| c.domain == d).unwrap().kind;
        assert_eq!(kind_of("steady.com"), ChangeKind::Unchanged);
        assert_eq!(kind_of("dropper.com"), ChangeKind::Dropped);
        assert_eq!(kind_of("climber.com"), ChangeKind::Risen);
        assert_eq!(kind_of("slider.com"), ChangeKind::Fallen);
        assert_eq!(kind_of("fresh.com"), ChangeKind::New);

        let climber = report.changes.iter().find(|c| c.domain == "climber.com").unwrap();
        assert_eq!(climber.delta, Some(-6));
        assert_eq!(climber.percent(), Some(60.0));
    }

    #[test]
    fn test_ordering_by_magnitude() {
        let store = two_day_store();
        let report = RankChangeAnalyzer::new(&store).compare("t".into(), day("2024-06-01"), day("2024-06-08"));
        let order: Vec<&str> = report.changes.iter().map(|c| c.domain.as_str()).collect();

        assert_eq!(
            order,
            vec!["dropper.com", "fresh.com", "climber.com", "slider.com", "steady.com"]
        );
    }

    #[test]
    fn test_week_snaps_to_earlier_snapshot() {
        let store = two_day_store();
        let analyzer = RankChangeAnalyzer::new(&store);
        assert_eq!(analyzer.resolve(Period::Week).unwrap(), (day("2024-06-01"), day("2024-06-08")));

        let err = analyzer.resolve(Period::Month).unwrap_err();
        assert!(matches!(err, RankError::NoSnapshotOnOrBefore(d) if d == day("2024-05-09")));
    }

    #[test]
    fn test_custom_period_swaps_reversed_dates() {
        let store = two_day_store();
        let analyzer = RankChangeAnalyzer::new(&store);
        let period = Period::Custom {
            start: day("2024-06-09"),
            end: day("2024-06-01"),
        };
        assert_eq!(analyzer.resolve(period).unwrap(), (day("2024-06-01"), day("2024-06-08")));
    }

    #[test]
    fn test_csv_reports() {
        let tmp = TempDir::new().unwrap();
        let store = two_day_store();
        let report = RankChangeAnalyzer::new(&store).analyze(Period::Week).unwrap();

        let paths = report.write_csv(tmp.path(), 100).unwrap();
        assert_eq!(paths.len(), 3);

        let rising = fs::read_to_string(tmp.path().join("rising_week.csv")).unwrap();
        assert_eq!(
            rising,
            "domain,start_rank,end_rank,rank_change,change_percent,classification\n\
             climber.com,10,4,-6,60.00%,risen\n"
        );

        let all = fs::read_to_string(tmp.path().join("rank_changes_week.csv")).unwrap();
        assert_eq!(all.lines().count(), 5);
        assert!(all.contains("fresh.com,0,2,,new,new"));
    }
}
