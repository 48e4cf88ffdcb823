pub mod analyzer;
pub mod args;
pub mod backfill;
pub mod config;
pub mod detector;
pub mod domain;
pub mod error;
pub mod export;
pub mod feed;
pub mod progress;
pub mod snapshot;
pub mod sqlite;
pub mod stats;
pub mod store;
pub mod update;
pub mod utils;

pub use analyzer::{ChangeKind, ChangeReport, Period, RankChangeAnalyzer};
pub use args::Args;
pub use backfill::{BackfillMode, BackfillOptions, BackfillOrchestrator, ChunkSize};
pub use config::Config;
pub use detector::{NewDomainDetector, NewDomains, ReportWriter};
pub use error::{RankError, Result};
pub use feed::{DirectoryFeed, FeedSource};
pub use progress::{ChunkId, ChunkState, ProgressTracker};
pub use snapshot::{RankSnapshot, SnapshotParser};
pub use sqlite::{SqliteStore, StorePersistence};
pub use stats::{BackfillSummary, StoreStats, UpdateSummary};
pub use store::{RankCell, TimeSeriesStore};
pub use update::run_daily_update;
