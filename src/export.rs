use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use crate::error::Result;
use crate::sqlite::format_date;
use crate::store::{DomainHistory, RankCell, TimeSeriesStore};
use crate::utils::write_atomic;

pub const DEFAULT_SPLIT_SIZE: usize = 1_000_000;
pub const FIRST_SEEN_FILE: &str = "domains_first_seen.csv";

/// Writes the store in wide form: one row per domain, one column per
/// committed date, `0` where the domain was absent. Rows are split across
/// `domains_rankings_<n>.csv` files of at most `split_size` domains.
pub fn export_wide(store: &TimeSeriesStore, dir: &Path, split_size: usize) -> Result<Vec<PathBuf>> {
    let start_time = Instant::now();
    let split_size = split_size.max(1);
    let header = std::iter::once("domain".to_string())
        .chain(store.dates().iter().map(|d| format_date(*d)))
        .collect::<Vec<_>>()
        .join(",");

    let domains: Vec<(&str, &DomainHistory)> = store.domains().collect();
    let mut written = Vec::new();

    for (index, part) in domains.chunks(split_size).enumerate() {
        let path = dir.join(format!("domains_rankings_{}.csv", index + 1));
        write_atomic(&path, |w| {
            writeln!(w, "{}", header)?;
            for (name, history) in part {
                write!(w, "{}", name)?;
                for date in store.dates() {
                    let cell = history.ranks().get(date).copied().unwrap_or(RankCell::Absent);
                    write!(w, ",{}", cell.to_raw())?;
                }
                writeln!(w)?;
            }
            Ok(())
        })?;
        info!(action = "write", component = "wide_export", path = ?path, domains = part.len(), "Ranking export written");
        written.push(path);
    }

    let first_seen_path = dir.join(FIRST_SEEN_FILE);
    write_atomic(&first_seen_path, |w| {
        writeln!(w, "domain,first_seen")?;
        for (name, history) in &domains {
            writeln!(w, "{},{}", name, format_date(history.first_seen()))?;
        }
        Ok(())
    })?;
    written.push(first_seen_path);

    info!(
        action = "complete",
        component = "wide_export",
        domains = domains.len(),
        dates = store.dates().len(),
        files = written.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Wide export completed"
    );
    Ok(written)
}
