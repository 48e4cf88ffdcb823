use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::export::DEFAULT_SPLIT_SIZE;

#[derive(Parser, Debug)]
#[command(
    name = "rankledger",
    about = "Track daily domain popularity rankings in a local time-series store",
    version,
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Base directory for the store and the progress file
    #[arg(long, global = true, env = "RANKLEDGER_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory holding the daily ranking feeds
    #[arg(long, global = true, env = "RANKLEDGER_FEED_DIR", default_value = "historical_extracts")]
    pub feed_dir: PathBuf,

    /// SQLite store path (defaults to <data-dir>/domain_rank.db)
    #[arg(long, global = true, env = "RANKLEDGER_STORE")]
    pub store: Option<PathBuf>,

    /// Backfill progress file (defaults to <data-dir>/backfill_progress.json)
    #[arg(long, global = true, env = "RANKLEDGER_PROGRESS_FILE")]
    pub progress_file: Option<PathBuf>,

    /// Output directory for rank change reports
    #[arg(long, global = true, env = "RANKLEDGER_REPORTS_DIR", default_value = "reports")]
    pub reports_dir: PathBuf,

    /// Output directory for new-domain reports
    #[arg(long, global = true, env = "RANKLEDGER_NEW_DOMAINS_DIR", default_value = "new_domains")]
    pub new_domains_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true, env = "RANKLEDGER_VERBOSE")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge one day's snapshot into the store
    Update(UpdateArgs),
    /// Import a date range in resumable chunks
    Backfill(BackfillArgs),
    /// Compare rankings between two snapshot dates
    Analyze(AnalyzeArgs),
    /// Write the store as wide CSV files
    Export(ExportArgs),
    /// Show store and backfill progress
    Status,
}

#[derive(clap::Args, Debug)]
pub struct UpdateArgs {
    /// Snapshot date (defaults to today)
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Skip writing new-domain reports
    #[arg(long)]
    pub no_reports: bool,
}

#[derive(clap::Args, Debug)]
pub struct BackfillArgs {
    /// First date to import (defaults to the earliest available feed)
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Last date to import (defaults to the latest available feed)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Days per chunk
    #[arg(long, conflicts_with = "chunk_rows")]
    pub chunk_days: Option<u32>,

    /// Approximate feed rows per chunk
    #[arg(long)]
    pub chunk_rows: Option<usize>,

    /// Only reprocess chunks that failed or were interrupted
    #[arg(long)]
    pub retry_failed: bool,

    /// Discard saved progress before starting
    #[arg(long)]
    pub reset_progress: bool,

    /// Stop at the first failing chunk
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Number of parser threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Skip writing new-domain reports
    #[arg(long)]
    pub no_reports: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodArg {
    Week,
    Month,
}

#[derive(clap::Args, Debug)]
pub struct AnalyzeArgs {
    /// Comparison window ending at the latest snapshot
    #[arg(long, value_enum, default_value_t = PeriodArg::Week)]
    pub period: PeriodArg,

    /// Custom start date (requires --end)
    #[arg(long)]
    pub start: Option<NaiveDate>,

    /// Custom end date (requires --start)
    #[arg(long)]
    pub end: Option<NaiveDate>,

    /// Number of rows per report
    #[arg(short, long, default_value_t = 100)]
    pub top: usize,
}

#[derive(clap::Args, Debug)]
pub struct ExportArgs {
    /// Maximum domains per CSV file
    #[arg(long, default_value_t = DEFAULT_SPLIT_SIZE)]
    pub split_size: usize,

    /// Output directory (defaults to <data-dir>/export)
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_backfill_flags() {
        let args = Args::try_parse_from([
            "rankledger",
            "backfill",
            "--start",
            "2024-06-08",
            "--end",
            "2024-06-12",
            "--chunk-days",
            "2",
            "--retry-failed",
        ])
        .unwrap();

        match args.command {
            Command::Backfill(b) => {
                assert_eq!(b.start, NaiveDate::from_ymd_opt(2024, 6, 8));
                assert_eq!(b.chunk_days, Some(2));
                assert!(b.retry_failed);
                assert!(!b.reset_progress);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_chunk_flags_conflict() {
        let result = Args::try_parse_from([
            "rankledger",
            "backfill",
            "--chunk-days",
            "2",
            "--chunk-rows",
            "1000",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["rankledger", "status", "--data-dir", "/tmp/x", "-v"]).unwrap();
        assert_eq!(args.data_dir, PathBuf::from("/tmp/x"));
        assert!(args.verbose);
    }
}
