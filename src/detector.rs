use chrono::NaiveDate;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::sqlite::format_date;
use crate::store::TimeSeriesStore;
use crate::utils::write_atomic;

/// Fixed-name file always holding the most recent run's discoveries.
pub const LATEST_REPORT_NAME: &str = "latest.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDomains {
    pub date: NaiveDate,
    pub domains: Vec<String>,
    /// Cold start: everything was first seen today, nothing is reported.
    pub suppressed: bool,
}

impl NewDomains {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

pub struct NewDomainDetector;

impl NewDomainDetector {
    /// A merge into a store with no history is a bootstrap load.
    pub fn is_first_run(before: &TimeSeriesStore) -> bool {
        before.is_empty()
    }

    /// Domains whose first-seen date is `date` after the merge. Re-merging a
    /// date reports the same domains again.
    pub fn detect(
        after: &TimeSeriesStore,
        date: NaiveDate,
        is_first_run: bool,
    ) -> NewDomains {
        if is_first_run {
            info!(
                action = "suppress",
                component = "new_domain_detector",
                date = %date,
                seeded = after.domains_first_seen_on(date).len(),
                "First run, treating all domains as seed data"
            );
            return NewDomains {
                date,
                domains: Vec::new(),
                suppressed: true,
            };
        }

        let domains: Vec<String> = after
            .domains_first_seen_on(date)
            .into_iter()
            .map(str::to_string)
            .collect();
        info!(
            action = "detect",
            component = "new_domain_detector",
            date = %date,
            new_domains = domains.len(),
            "New domains detected"
        );

        NewDomains {
            date,
            domains,
            suppressed: false,
        }
    }
}

/// Writes one `<date>.txt` per processed date plus [`LATEST_REPORT_NAME`].
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dated_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.txt", format_date(date)))
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_REPORT_NAME)
    }

    /// Writes the dated report, and the aggregate when `update_latest`.
    /// Suppressed results write nothing and return `None`.
    pub fn write(&self, report: &NewDomains, update_latest: bool) -> Result<Option<PathBuf>> {
        if report.suppressed {
            return Ok(None);
        }

        let dated = self.dated_path(report.date);
        write_domain_list(&dated, &report.domains)?;
        if update_latest {
            write_domain_list(&self.latest_path(), &report.domains)?;
        }

        if report.is_empty() {
            warn!(action = "write", component = "report_writer", date = %report.date, path = ?dated, "No new domains for date");
        } else {
            info!(action = "write", component = "report_writer", date = %report.date, path = ?dated, count = report.domains.len(), "New domain report written");
        }
        Ok(Some(dated))
    }
}

fn write_domain_list(path: &Path, domains: &[String]) -> Result<()> {
    write_atomic(path, |w| {
        for domain in domains {
            writeln!(w, "{}", domain)?;
        }
        Ok(())
    })?;
    Ok(())
}
