use chrono::NaiveDate;
use std::time::Instant;
use tracing::info;

use crate::detector::{NewDomainDetector, ReportWriter};
use crate::error::Result;
use crate::feed::FeedSource;
use crate::sqlite::StorePersistence;
use crate::stats::UpdateSummary;

/// Merges the snapshot for `date` into the persisted store.
///
/// The store is only replaced on disk once the merge is complete, and the
/// new-domain reports are only written after that save succeeded.
pub fn run_daily_update<F, P>(
    feed: &F,
    persistence: &P,
    reports: Option<&ReportWriter>,
    date: NaiveDate,
) -> Result<UpdateSummary>
where
    F: FeedSource + ?Sized,
    P: StorePersistence + ?Sized,
{
    let start_time = Instant::now();
    info!(action = "start", component = "daily_update", date = %date, "Starting daily update");

    let parsed = feed.load_snapshot(date)?;
    let mut store = persistence.load()?;
    let first_run = NewDomainDetector::is_first_run(&store);

    let merge = store.merge(&parsed.snapshot);
    let new_domains = NewDomainDetector::detect(&store, date, first_run);

    persistence.save(&store)?;

    let report_path = match reports {
        Some(writer) => writer.write(&new_domains, true)?,
        None => None,
    };

    info!(
        action = "complete",
        component = "daily_update",
        date = %date,
        ranked = merge.ranked,
        created = merge.created,
        marked_absent = merge.marked_absent,
        remerged = merge.remerged,
        new_domains = new_domains.domains.len(),
        duration_ms = start_time.elapsed().as_millis(),
        "Daily update completed"
    );

    Ok(UpdateSummary {
        date,
        parse: parsed.report,
        merge,
        new_domains,
        report_path,
    })
}
