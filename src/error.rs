use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = RankError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RankError {
    /// Feed file for a date is missing or unreadable.
    #[error("source for {date} unavailable at {path:?}: {reason}")]
    SourceUnavailable {
        date: NaiveDate,
        path: PathBuf,
        reason: String,
    },

    /// A single feed line failed to parse.
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// Store could not be written or read back.
    #[error("store persistence failed: {0}")]
    PersistenceFailure(String),

    /// Progress file exists but cannot be trusted.
    #[error("progress file {path:?} is corrupt: {reason}")]
    ProgressCorruption { path: PathBuf, reason: String },

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("no snapshot recorded on or before {0}")]
    NoSnapshotOnOrBefore(NaiveDate),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for RankError {
    fn from(err: rusqlite::Error) -> Self {
        RankError::PersistenceFailure(err.to_string())
    }
}

impl RankError {
    pub fn is_source_unavailable(&self) -> bool {
        matches!(self, RankError::SourceUnavailable { .. })
    }
}
