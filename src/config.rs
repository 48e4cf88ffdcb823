use std::path::{Path, PathBuf};

use crate::args::Args;

pub const STORE_FILE: &str = "domain_rank.db";
pub const PROGRESS_FILE: &str = "backfill_progress.json";
pub const EXPORT_DIR: &str = "export";

/// Resolved locations for every file the tool reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub feed_dir: PathBuf,
    pub store_path: PathBuf,
    pub progress_path: PathBuf,
    pub reports_dir: PathBuf,
    pub new_domains_dir: PathBuf,
}

impl Config {
    /// Defaults rooted at `data_dir`, with the other directories relative
    /// to the working directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            store_path: data_dir.join(STORE_FILE),
            progress_path: data_dir.join(PROGRESS_FILE),
            feed_dir: PathBuf::from("historical_extracts"),
            reports_dir: PathBuf::from("reports"),
            new_domains_dir: PathBuf::from("new_domains"),
            data_dir,
        }
    }

    pub fn from_args(args: &Args) -> Self {
        let mut config = Self::new(&args.data_dir);
        if let Some(store) = &args.store {
            config.store_path = store.clone();
        }
        if let Some(progress) = &args.progress_file {
            config.progress_path = progress.clone();
        }
        config.feed_dir = args.feed_dir.clone();
        config.reports_dir = args.reports_dir.clone();
        config.new_domains_dir = args.new_domains_dir.clone();
        config
    }

    pub fn export_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        override_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.data_dir.join(EXPORT_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_paths_follow_data_dir() {
        let args = Args::try_parse_from(["rankledger", "--data-dir", "/srv/ranks", "status"]).unwrap();
        let config = Config::from_args(&args);
        assert_eq!(config.store_path, PathBuf::from("/srv/ranks/domain_rank.db"));
        assert_eq!(config.progress_path, PathBuf::from("/srv/ranks/backfill_progress.json"));
        assert_eq!(config.export_dir(None), PathBuf::from("/srv/ranks/export"));
    }

    #[test]
    fn test_explicit_paths_win() {
        let args = Args::try_parse_from([
            "rankledger",
            "--store",
            "/tmp/other.db",
            "--progress-file",
            "/tmp/progress.json",
            "status",
        ])
        .unwrap();
        let config = Config::from_args(&args);
        assert_eq!(config.store_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.progress_path, PathBuf::from("/tmp/progress.json"));
    }
}
